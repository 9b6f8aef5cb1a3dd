/// One bandwidth evaluation, fanned out to every monitor subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyData {
    pub bytes_sent_per_second: u64,
    pub bytes_recv_per_second: u64,
    pub sent_limit: u64,
    pub recv_limit: u64,
    pub is_sent_ok: bool,
    pub is_recv_ok: bool,
    pub is_ok: bool,
    pub span_seconds: f64,
    /// False when the baseline fell back to the oldest sample on record.
    pub uses_stable_baseline: bool,
}

impl NotifyData {
    /// Build from measured rates. A limit of 0 is unlimited.
    pub fn from_rates(
        sent_rate: u64,
        recv_rate: u64,
        sent_limit: u64,
        recv_limit: u64,
        span_seconds: f64,
        uses_stable_baseline: bool,
    ) -> Self {
        let is_sent_ok = sent_limit == 0 || sent_rate <= sent_limit;
        let is_recv_ok = recv_limit == 0 || recv_rate <= recv_limit;
        Self {
            bytes_sent_per_second: sent_rate,
            bytes_recv_per_second: recv_rate,
            sent_limit,
            recv_limit,
            is_sent_ok,
            is_recv_ok,
            is_ok: is_sent_ok && is_recv_ok,
            span_seconds,
            uses_stable_baseline,
        }
    }
}
