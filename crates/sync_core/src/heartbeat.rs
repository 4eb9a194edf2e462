use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Ping,
    Dead { missed: u8 },
}

/// Liveness bookkeeping for one push link. Any inbound frame counts as a sign of
/// life; `missed_limit` silent ticks in a row mean the link died without a close.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    missed_limit: u8,
    missed: u8,
    traffic_seen: bool,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, missed_limit: u8) -> Self {
        Self {
            interval,
            missed_limit: missed_limit.max(1),
            missed: 0,
            traffic_seen: true,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn on_traffic(&mut self) {
        self.traffic_seen = true;
    }

    pub fn on_tick(&mut self) -> HeartbeatVerdict {
        if std::mem::replace(&mut self.traffic_seen, false) {
            self.missed = 0;
        } else {
            self.missed += 1;
            if self.missed >= self.missed_limit {
                return HeartbeatVerdict::Dead {
                    missed: self.missed,
                };
            }
        }
        HeartbeatVerdict::Ping
    }
}
