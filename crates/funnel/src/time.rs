//! Fire-time arithmetic. Day offsets are calendar days in the partner's
//! time zone, not 24-hour blocks.

use chrono::{DateTime, Days, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::types::Stage;

/// A stage paired with the absolute instant it fires for a given anchor.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledStage<'a> {
    pub fire_at: DateTime<Utc>,
    pub stage: &'a Stage,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeCalculator {
    tz: Tz,
}

impl TimeCalculator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self { tz: Tz::UTC }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Absolute fire instant of `stage` for an enrollment anchored at `anchor_at`.
    pub fn fire_time_of(&self, anchor_at: DateTime<Utc>, stage: &Stage) -> DateTime<Utc> {
        if stage.day_offset == 0 && stage.time_of_day.is_none() {
            return anchor_at;
        }

        let local = anchor_at.with_timezone(&self.tz);
        let date = local
            .date_naive()
            .checked_add_days(Days::new(u64::from(stage.day_offset)))
            .unwrap_or(chrono::NaiveDate::MAX);
        let time = stage.time_of_day.unwrap_or_else(|| local.time());

        self.resolve_local(date.and_time(time))
    }

    /// Map a partner-local wall time to one instant. Ambiguous times take the
    /// earlier instant; times inside a DST gap are shifted forward by the
    /// length of the gap.
    fn resolve_local(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::None => {
                // Interpret the wall time with the offset in force before the gap.
                let before = self
                    .tz
                    .offset_from_utc_datetime(&(naive - Duration::days(1)))
                    .fix();
                let utc = naive - Duration::seconds(i64::from(before.local_minus_utc()));
                DateTime::from_naive_utc_and_offset(utc, Utc)
            }
        }
    }

    /// All stages of a campaign in firing order: by fire instant, then by
    /// stage number.
    pub fn schedule<'a>(&self, anchor_at: DateTime<Utc>, stages: &'a [Stage]) -> Vec<ScheduledStage<'a>> {
        let mut scheduled: Vec<ScheduledStage<'a>> = stages
            .iter()
            .map(|stage| ScheduledStage {
                fire_at: self.fire_time_of(anchor_at, stage),
                stage,
            })
            .collect();
        scheduled.sort_by(|a, b| {
            a.fire_at
                .cmp(&b.fire_at)
                .then(a.stage.number.cmp(&b.stage.number))
        });
        scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::{America, Asia};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_offset_with_time_of_day() {
        let calc = TimeCalculator::utc();
        let stage = Stage::new(1, 3, "hello").at(9, 0);
        assert_eq!(
            calc.fire_time_of(utc(2024, 1, 1, 22, 0), &stage),
            utc(2024, 1, 4, 9, 0)
        );
    }

    #[test]
    fn test_offset_in_partner_zone() {
        let calc = TimeCalculator::new(Asia::Seoul);
        let anchor = Asia::Seoul
            .with_ymd_and_hms(2024, 1, 1, 22, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let stage = Stage::new(1, 3, "hello").at(9, 0);
        let expected = Asia::Seoul
            .with_ymd_and_hms(2024, 1, 4, 9, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(calc.fire_time_of(anchor, &stage), expected);
    }

    #[test]
    fn test_zero_offset_fires_at_anchor() {
        let calc = TimeCalculator::new(Asia::Seoul);
        let anchor = Utc.with_ymd_and_hms(2024, 5, 5, 3, 17, 42).unwrap()
            + Duration::milliseconds(250);
        assert_eq!(calc.fire_time_of(anchor, &Stage::new(1, 0, "now")), anchor);
    }

    #[test]
    fn test_zero_offset_with_time_can_be_in_the_past() {
        let calc = TimeCalculator::utc();
        let stage = Stage::new(1, 0, "morning").at(9, 0);
        assert_eq!(
            calc.fire_time_of(utc(2024, 1, 1, 22, 0), &stage),
            utc(2024, 1, 1, 9, 0)
        );
    }

    #[test]
    fn test_calendar_day_across_spring_forward() {
        let calc = TimeCalculator::new(America::New_York);
        // Noon EST the day before clocks change.
        let anchor = utc(2024, 3, 9, 17, 0);
        let fired = calc.fire_time_of(anchor, &Stage::new(1, 1, "x"));
        // Noon EDT: only 23 hours later.
        assert_eq!(fired, utc(2024, 3, 10, 16, 0));
        assert_eq!(fired - anchor, Duration::hours(23));
    }

    #[test]
    fn test_time_in_gap_shifts_forward() {
        let calc = TimeCalculator::new(America::New_York);
        let stage = Stage::new(1, 1, "x").at(2, 30);
        // 02:30 on 2024-03-10 does not exist in New York; lands on 03:30 EDT.
        assert_eq!(
            calc.fire_time_of(utc(2024, 3, 9, 17, 0), &stage),
            utc(2024, 3, 10, 7, 30)
        );
    }

    #[test]
    fn test_ambiguous_time_takes_earlier_instant() {
        let calc = TimeCalculator::new(America::New_York);
        let stage = Stage::new(1, 1, "x").at(1, 30);
        // 01:30 on 2024-11-03 happens twice; the EDT occurrence is 05:30 UTC.
        assert_eq!(
            calc.fire_time_of(utc(2024, 11, 2, 16, 0), &stage),
            utc(2024, 11, 3, 5, 30)
        );
    }

    #[test]
    fn test_schedule_orders_by_fire_time_then_number() {
        let calc = TimeCalculator::utc();
        let stages = vec![
            Stage::new(1, 2, "a"),
            Stage::new(2, 1, "b").at(9, 0),
            Stage::new(3, 1, "c").at(9, 0),
            Stage::new(4, 0, "d"),
        ];
        let order: Vec<u32> = calc
            .schedule(utc(2024, 1, 1, 12, 0), &stages)
            .iter()
            .map(|s| s.stage.number)
            .collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }
}
