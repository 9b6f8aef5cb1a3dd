use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::rule::CountRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// A forward rule with every address resolved and validated.
#[derive(Debug, Clone)]
pub struct ResolvedForward {
    pub listen_port: u16,
    pub ipv4_bind: Ipv4Addr,
    pub ipv6_bind: Ipv6Addr,
    pub ipv4_target: Option<SocketAddr>,
    pub ipv6_target: Option<SocketAddr>,
    pub allow_cross: bool,
    pub ipv4_src_proxy: bool,
    pub ipv6_src_proxy: bool,
    pub ipv4_dest_proxy: bool,
    pub ipv6_dest_proxy: bool,
    pub dest_proxy_version: ProxyVersion,
    /// Empty means "use the group's count rules".
    pub count_rules: Vec<CountRule>,
}

/// One listener a forward server will open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerPlan {
    pub listen: SocketAddr,
    pub target: SocketAddr,
    /// Parse a PROXY header off accepted connections.
    pub src_proxy: bool,
    /// Write a PROXY header to the backend.
    pub dest_proxy: Option<ProxyVersion>,
    /// Listener family differs from target family.
    pub bridged: bool,
}

impl ResolvedForward {
    /// Work out which listeners to open given host family support.
    pub fn plan(&self, ipv4_supported: bool, ipv6_supported: bool) -> Vec<ListenerPlan> {
        let v4_target = self.ipv4_target.filter(|_| ipv4_supported);
        let v6_target = self.ipv6_target.filter(|_| ipv6_supported);

        let mut plans = Vec::with_capacity(2);

        if ipv4_supported {
            let target = v4_target.or_else(|| v6_target.filter(|_| self.allow_cross));
            if let Some(target) = target {
                plans.push(self.listener(
                    IpAddr::V4(self.ipv4_bind),
                    target,
                    self.ipv4_src_proxy,
                    self.ipv4_dest_proxy,
                ));
            }
        }

        if ipv6_supported {
            let target = v6_target.or_else(|| v4_target.filter(|_| self.allow_cross));
            if let Some(target) = target {
                plans.push(self.listener(
                    IpAddr::V6(self.ipv6_bind),
                    target,
                    self.ipv6_src_proxy,
                    self.ipv6_dest_proxy,
                ));
            }
        }

        plans
    }

    /// PROXY headers are only honoured on a listener that serves its own
    /// family; a bridged listener never reads or writes one.
    fn listener(&self, bind: IpAddr, target: SocketAddr, src_proxy: bool, dest_proxy: bool) -> ListenerPlan {
        let bridged = bind.is_ipv4() != target.is_ipv4();
        ListenerPlan {
            listen: SocketAddr::new(bind, self.listen_port),
            target,
            src_proxy: !bridged && src_proxy,
            dest_proxy: (!bridged && dest_proxy).then_some(self.dest_proxy_version),
            bridged,
        }
    }
}
