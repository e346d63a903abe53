use chrono::{DateTime, Duration, LocalResult, TimeZone, Utc};
use chrono_tz::Tz;
use market_core::{MarketError, SessionStatus};

fn status_order(status: SessionStatus) -> u8 {
    match status {
        SessionStatus::Open => 0,
        SessionStatus::Closed => 1,
        SessionStatus::Running => 2,
        SessionStatus::Finished => 3,
    }
}

/// Session lifecycle guard: `open → closed → running → finished`, strictly
/// forward. Once finished a session is never resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    status: SessionStatus,
}

impl SessionState {
    pub fn new(status: SessionStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transition(&mut self, to: SessionStatus) -> Result<(), MarketError> {
        if status_order(to) <= status_order(self.status) {
            return Err(MarketError::Validation(format!(
                "invalid session transition {} -> {}",
                self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// Next UTC instant whose local hour in `tz` equals `gate_closure_hour`.
///
/// The naive local datetime is built first and localised afterwards so DST
/// transitions resolve correctly: in a fall-back ambiguity the
/// standard-offset instant wins, and an hour swallowed by spring-forward
/// shifts one hour later.
pub fn gate_closure_utc(
    now_utc: DateTime<Utc>,
    gate_closure_hour: u32,
    tz: Tz,
) -> Result<DateTime<Utc>, MarketError> {
    if gate_closure_hour > 23 {
        return Err(MarketError::Validation(format!(
            "gate_closure_hour must be between 0 and 23, got {gate_closure_hour}"
        )));
    }

    let now_local = now_utc.with_timezone(&tz);
    let mut naive = now_local
        .date_naive()
        .and_hms_opt(gate_closure_hour, 0, 0)
        .ok_or_else(|| MarketError::Validation("invalid gate closure time".to_string()))?;

    // Gate closure is always in the future.
    if naive <= now_local.naive_local() {
        naive += Duration::days(1);
    }

    let localized = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(_, standard) => standard,
        LocalResult::None => {
            // Spring-forward gap: the hour does not exist locally.
            match tz.from_local_datetime(&(naive + Duration::hours(1))) {
                LocalResult::Single(dt) => dt,
                LocalResult::Ambiguous(_, standard) => standard,
                LocalResult::None => {
                    return Err(MarketError::Validation(format!(
                        "cannot localise gate closure {naive} in {tz}"
                    )))
                }
            }
        }
    };

    Ok(localized.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn transitions_are_strictly_forward() {
        let mut state = SessionState::new(SessionStatus::Open);
        state.transition(SessionStatus::Closed).unwrap();
        state.transition(SessionStatus::Running).unwrap();
        state.transition(SessionStatus::Finished).unwrap();
        assert!(state.transition(SessionStatus::Running).is_err());
        assert!(state.transition(SessionStatus::Open).is_err());
    }

    #[test]
    fn skipping_states_forward_is_allowed() {
        // Stuck sessions can be force-finished from any earlier state.
        let mut state = SessionState::new(SessionStatus::Open);
        state.transition(SessionStatus::Finished).unwrap();
        assert_eq!(state.status(), SessionStatus::Finished);
    }

    #[test]
    fn gate_closure_rolls_to_tomorrow_when_hour_passed() {
        // 11:00 UTC in winter = 12:00 CET, past a 10:00 gate.
        let gate = gate_closure_utc(utc(2024, 1, 15, 11, 0), 10, chrono_tz::CET).unwrap();
        assert_eq!(gate, utc(2024, 1, 16, 9, 0));
    }

    #[test]
    fn gate_closure_same_day_when_hour_ahead() {
        // 06:00 UTC = 07:00 CET, before the 10:00 gate; CET is UTC+1.
        let gate = gate_closure_utc(utc(2024, 1, 15, 6, 0), 10, chrono_tz::CET).unwrap();
        assert_eq!(gate, utc(2024, 1, 15, 9, 0));
    }

    #[test]
    fn spring_forward_gap_shifts_one_hour() {
        // 2024-03-31: 02:00 CET does not exist; the gate lands on 03:00
        // CEST, which is 01:00 UTC.
        let now = utc(2024, 3, 30, 23, 30); // 00:30 local, before the gap
        let gate = gate_closure_utc(now, 2, chrono_tz::CET).unwrap();
        assert_eq!(gate, utc(2024, 3, 31, 1, 0));
    }

    #[test]
    fn fall_back_ambiguity_resolves_to_standard_time() {
        // 2024-10-27: 02:00 occurs twice; the standard-offset (UTC+1)
        // occurrence wins, i.e. 01:00 UTC.
        let now = utc(2024, 10, 26, 22, 30); // 00:30 local
        let gate = gate_closure_utc(now, 2, chrono_tz::CET).unwrap();
        assert_eq!(gate, utc(2024, 10, 27, 1, 0));
    }

    #[test]
    fn invalid_hour_is_rejected() {
        let err = gate_closure_utc(utc(2024, 1, 1, 0, 0), 24, chrono_tz::CET).unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[test]
    fn gate_closure_hour_matches_local_hour() {
        for hour in [0, 10, 23] {
            let gate = gate_closure_utc(utc(2024, 6, 1, 12, 0), hour, chrono_tz::CET).unwrap();
            assert_eq!(gate.with_timezone(&chrono_tz::CET).hour(), hour);
        }
    }
}
