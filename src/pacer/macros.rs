macro_rules! log_pacer_budget {
    ($($arg:expr),+) => {
        crate::log_stat!("PACER_BUDGET", $($arg),+);
    }
}

macro_rules! log_probe_cluster {
    ($($arg:expr),+) => {
        crate::log_stat!("PROBE_CLUSTER", $($arg),+);
    }
}

pub(crate) use log_pacer_budget;
pub(crate) use log_probe_cluster;
