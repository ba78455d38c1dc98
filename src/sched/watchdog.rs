use crate::time::Time;

/// The single pending wakeup of a scheduler instance. A new request
/// replaces any prior one.
#[derive(Debug, Default, derive_new::new)]
pub(crate) struct Watchdog {
    #[new(default)]
    pending: Option<Time>,
}

impl Watchdog {
    pub(crate) fn schedule(&mut self, at: Time) {
        self.pending = Some(at);
    }

    pub(crate) fn cancel(&mut self) {
        self.pending = None;
    }

    pub(crate) fn pending(&self) -> Option<Time> {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_request_wins() {
        let mut wd = Watchdog::new();
        assert_eq!(wd.pending(), None);
        wd.schedule(Time::new(50));
        wd.schedule(Time::new(20));
        assert_eq!(wd.pending(), Some(Time::new(20)));
        wd.cancel();
        assert_eq!(wd.pending(), None);
    }
}
