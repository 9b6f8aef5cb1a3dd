use std::fmt;

/// Resolved geographic placement of an address. Empty fields are unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub nation: String,
    pub province: String,
    pub city: String,
    pub isp: String,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.nation.is_empty() && self.province.is_empty() && self.city.is_empty() && self.isp.is_empty()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} ({})", self.nation, self.province, self.city, self.isp)
    }
}
