//! Keeps the system clock in step with the RTC.
//!
//! When the host sleeps, the guest's system clock stops advancing while
//! the virtual RTC keeps following the host's wall time. After wake-up the
//! guest would otherwise run with a stale clock until NTP catches up.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_settime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// RTC time in whole seconds since the Unix epoch.
const RTC_SINCE_EPOCH: &str = "/sys/class/rtc/rtc0/since_epoch";
/// How often the clocks are compared.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Largest skew left alone.
const MAX_SKEW: Duration = Duration::from_secs(2);

/// Compares the clocks every [`CHECK_INTERVAL`] and resets the system
/// clock from the RTC when they drift apart. Never returns.
pub async fn run() {
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = SystemTime::now();
        let rtc = match read_rtc(Path::new(RTC_SINCE_EPOCH)) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot read the RTC");
                continue;
            }
        };
        let drift = skew(rtc, now);
        debug!(?drift, "rtc/system clock skew");
        if drift > MAX_SKEW {
            match set_system_time(rtc) {
                Ok(()) => info!(?drift, "system time synchronized with rtc"),
                Err(e) => warn!(error = %e, "failed to set the system clock"),
            }
        }
    }
}

/// Absolute difference between two instants.
fn skew(rtc: SystemTime, now: SystemTime) -> Duration {
    rtc.duration_since(now).unwrap_or_else(|e| e.duration())
}

/// Reads the RTC through sysfs.
fn read_rtc(path: &Path) -> io::Result<SystemTime> {
    let text = fs::read_to_string(path)?;
    let secs: u64 = text
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(UNIX_EPOCH + Duration::from_secs(secs))
}

/// Sets `CLOCK_REALTIME`.
fn set_system_time(t: SystemTime) -> io::Result<()> {
    let since = t
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    clock_settime(ClockId::CLOCK_REALTIME, TimeSpec::from_duration(since))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_skew_is_left_alone() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert!(skew(now + Duration::from_secs(1), now) <= MAX_SKEW);
        assert!(skew(now - Duration::from_secs(2), now) <= MAX_SKEW);
    }

    #[test]
    fn large_skew_either_way_is_detected() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(skew(now + Duration::from_secs(90), now), Duration::from_secs(90));
        assert_eq!(skew(now - Duration::from_secs(3), now), Duration::from_secs(3));
        assert!(skew(now - Duration::from_secs(3), now) > MAX_SKEW);
    }

    #[test]
    fn reads_rtc_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("since_epoch");
        fs::write(&path, "1700000123\n").unwrap();
        assert_eq!(
            read_rtc(&path).unwrap(),
            UNIX_EPOCH + Duration::from_secs(1_700_000_123)
        );

        fs::write(&path, "garbage").unwrap();
        assert_eq!(
            read_rtc(&path).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
