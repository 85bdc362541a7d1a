// Login timeout scaling
//
// A login round trip crosses the path twice, so the wait grows with hop
// count. Unknown or flood paths get the maximum.

use crate::config::SessionConfig;
use std::time::Duration;

/// Time to wait for a login result over a path of `hops` hops
pub fn login_timeout(hops: Option<u8>, config: &SessionConfig) -> Duration {
    let max = Duration::from_millis(config.login_max_timeout_ms);
    let Some(hops) = hops else {
        return max;
    };
    let scaled = config
        .login_per_hop_timeout_ms
        .saturating_mul(u64::from(hops))
        .saturating_add(config.login_base_timeout_ms);
    Duration::from_millis(scaled).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_neighbour_gets_base() {
        let config = SessionConfig::default();
        assert_eq!(login_timeout(Some(0), &config), Duration::from_secs(5));
        assert_eq!(login_timeout(Some(2), &config), Duration::from_secs(25));
    }

    #[test]
    fn test_unknown_path_gets_max() {
        let config = SessionConfig::default();
        assert_eq!(login_timeout(None, &config), Duration::from_secs(60));
        assert_eq!(login_timeout(Some(40), &config), Duration::from_secs(60));
    }
}
