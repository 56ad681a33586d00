//! Per-session counters and policy thresholds. Pure comparisons, no I/O.

/// Fixed reply for a client caught talking before its turn.
pub const ETALKER_MSG: &str = "554 Misbehaved SMTP session (EarlyTalker)";

/// Configured hard limits for a single session.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_messages: u64,
    pub max_errors: u32,
    pub max_vrfy: u32,
    pub max_noop: u32,
    pub max_rcpt: usize,
}

/// Counters reset at RSET and after each completed transaction.
#[derive(Debug, Default, Clone)]
pub struct SessionCounters {
    pub errors: u32,
    pub noop: u32,
    pub vrfy: u32,
}

impl SessionCounters {
    pub fn reset(&mut self) {
        self.errors = 0;
        self.noop = 0;
        self.vrfy = 0;
    }
}

impl Limits {
    /// Composite check run after every response. Returns the terminal
    /// reply for the first exceeded threshold, or `None`.
    pub fn check(
        &self,
        counters: &SessionCounters,
        msg_count: u64,
        rcpt_count: usize,
        early_talker: bool,
    ) -> Option<&'static str> {
        if msg_count > self.max_messages {
            Some("451 Session messages count exceeded")
        } else if counters.errors > self.max_errors {
            Some("550 Max errors exceeded")
        } else if counters.vrfy > self.max_vrfy {
            Some("451 Max recipient verification exceeded")
        } else if counters.noop > self.max_noop {
            Some("451 Max NOOP count exceeded")
        } else if rcpt_count > self.max_rcpt {
            Some("452 Too many recipients")
        } else if early_talker {
            Some(ETALKER_MSG)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_messages: 2,
            max_errors: 3,
            max_vrfy: 4,
            max_noop: 5,
            max_rcpt: 6,
        }
    }

    #[test]
    fn test_within_limits() {
        let counters = SessionCounters::default();
        assert_eq!(limits().check(&counters, 0, 0, false), None);
        // at the threshold is still fine, only exceeding trips
        assert_eq!(limits().check(&counters, 2, 6, false), None);
    }

    #[test]
    fn test_each_threshold() {
        let mut counters = SessionCounters::default();
        assert_eq!(
            limits().check(&counters, 3, 0, false),
            Some("451 Session messages count exceeded")
        );
        counters.errors = 4;
        assert_eq!(
            limits().check(&counters, 0, 0, false),
            Some("550 Max errors exceeded")
        );
        counters.errors = 0;
        counters.vrfy = 5;
        assert_eq!(
            limits().check(&counters, 0, 0, false),
            Some("451 Max recipient verification exceeded")
        );
        counters.vrfy = 0;
        counters.noop = 6;
        assert_eq!(
            limits().check(&counters, 0, 0, false),
            Some("451 Max NOOP count exceeded")
        );
        counters.noop = 0;
        assert_eq!(
            limits().check(&counters, 0, 7, false),
            Some("452 Too many recipients")
        );
        assert_eq!(limits().check(&counters, 0, 0, true), Some(ETALKER_MSG));
    }

    #[test]
    fn test_message_count_takes_precedence() {
        let mut counters = SessionCounters::default();
        counters.errors = 10;
        assert_eq!(
            limits().check(&counters, 10, 0, true),
            Some("451 Session messages count exceeded")
        );
    }

    #[test]
    fn test_counter_reset() {
        let mut counters = SessionCounters {
            errors: 1,
            noop: 2,
            vrfy: 3,
        };
        counters.reset();
        assert_eq!(counters.errors, 0);
        assert_eq!(counters.noop, 0);
        assert_eq!(counters.vrfy, 0);
    }
}
