//! Node identity and bus topic addressing.
//!
//! Every topic follows `<namespace>/<unit>/<experiment>/<job>/<attribute>`.
//! The broadcast unit and the universal experiment let cluster-wide commands
//! and experiment-independent jobs share the same addressing scheme.

use crate::config::Config;

/// Wildcard unit identifier: messages addressed to it reach every node.
pub const UNIVERSAL_UNIT: &str = "$broadcast";

/// Experiment identifier for jobs that outlive any single experiment
/// (the monitor, cluster-wide run commands).
pub const UNIVERSAL_EXPERIMENT: &str = "$experiment";

/// Fallback experiment name when the leader has never announced one.
pub const FALLBACK_EXPERIMENT: &str = "scratch";

/// This node's unit name: the config override if set, else the hostname.
pub fn unit_name(config: &Config) -> String {
    if !config.cluster.unit.is_empty() {
        return config.cluster.unit.clone();
    }
    hostname().unwrap_or_else(|| "unit0".to_string())
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf outlives the call and the length is passed alongside.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

/// Build a topic under this namespace: `<ns>/<unit>/<experiment>/<tail>`.
pub fn topic(namespace: &str, unit: &str, experiment: &str, tail: &str) -> String {
    format!("{namespace}/{unit}/{experiment}/{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_joins_segments() {
        assert_eq!(
            topic("petri", "unit3", "trial9", "stirring/$state"),
            "petri/unit3/trial9/stirring/$state"
        );
    }

    #[test]
    fn unit_name_prefers_config() {
        let mut config = Config::default();
        config.cluster.unit = "bench-a".into();
        assert_eq!(unit_name(&config), "bench-a");
    }

    #[test]
    fn unit_name_falls_back_to_hostname() {
        let config = Config::default();
        assert!(!unit_name(&config).is_empty());
    }
}
