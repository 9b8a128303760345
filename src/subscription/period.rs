//! # 订阅周期计算
//!
//! 时长与重置边界都按 UTC 日历计算。

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveTime, Utc};
use entity::subscription_plans::{self, DurationUnit, ResetPeriod};

/// 追赶错过的重置周期时的最大迭代次数
pub const MAX_CATCH_UP_CYCLES: usize = 1024;

fn to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// 由套餐时长计算结束时间, 配置无效时返回 `None`
#[must_use]
pub fn compute_end_time(start: i64, unit: DurationUnit, value: i32, custom_seconds: i64) -> Option<i64> {
    if unit == DurationUnit::Custom {
        return (custom_seconds > 0).then(|| start.saturating_add(custom_seconds));
    }
    let value = u32::try_from(value).ok().filter(|v| *v > 0)?;
    let begin = to_utc(start)?;
    let end = match unit {
        DurationUnit::Year => begin.checked_add_months(Months::new(value.checked_mul(12)?))?,
        DurationUnit::Month => begin.checked_add_months(Months::new(value))?,
        DurationUnit::Week => begin.checked_add_signed(Duration::weeks(i64::from(value)))?,
        DurationUnit::Day => begin.checked_add_signed(Duration::days(i64::from(value)))?,
        DurationUnit::Hour => begin.checked_add_signed(Duration::hours(i64::from(value)))?,
        DurationUnit::Custom => return None,
    };
    Some(end.timestamp())
}

/// 由套餐计算订阅的结束时间
#[must_use]
pub fn plan_end_time(plan: &subscription_plans::Model, start: i64) -> Option<i64> {
    compute_end_time(start, plan.duration_unit, plan.duration_value, plan.custom_seconds)
}

/// `base` 之后的下一个重置边界; 0 表示到期前不再重置
#[must_use]
pub fn next_reset_time(base: i64, period: ResetPeriod, custom_seconds: i64, end_time: i64) -> i64 {
    let next = match period {
        ResetPeriod::Never => None,
        ResetPeriod::Custom => (custom_seconds > 0).then(|| base.saturating_add(custom_seconds)),
        ResetPeriod::Daily => to_utc(base)
            .and_then(|dt| start_of_day(dt).checked_add_days(Days::new(1)))
            .map(|dt| dt.timestamp()),
        ResetPeriod::Weekly => to_utc(base)
            .and_then(|dt| {
                let until_monday = 7 - u64::from(dt.weekday().num_days_from_monday());
                start_of_day(dt).checked_add_days(Days::new(until_monday))
            })
            .map(|dt| dt.timestamp()),
        ResetPeriod::Monthly => to_utc(base)
            .and_then(|dt| {
                let day = dt.date_naive().with_day(1)?;
                day.and_time(NaiveTime::MIN)
                    .and_utc()
                    .checked_add_months(Months::new(1))
            })
            .map(|dt| dt.timestamp()),
    };

    match next {
        Some(next) if end_time <= 0 || next < end_time => next,
        _ => 0,
    }
}

/// 追赶到 `now` 为止的重置, 返回 (本次重置时间, 下一次重置时间)
///
/// 尚未到期时返回 `None`。
#[must_use]
pub fn catch_up(
    next_reset: i64,
    period: ResetPeriod,
    custom_seconds: i64,
    end_time: i64,
    now: i64,
) -> Option<(i64, i64)> {
    if next_reset <= 0 || next_reset > now {
        return None;
    }

    let mut last = next_reset;
    let mut next = next_reset_time(last, period, custom_seconds, end_time);
    let mut cycles = 1;
    while next > 0 && next <= now && cycles < MAX_CATCH_UP_CYCLES {
        last = next;
        next = next_reset_time(last, period, custom_seconds, end_time);
        cycles += 1;
    }
    if next > 0 && next <= now {
        // 追赶次数用尽, 从当前时刻重新起算
        last = now;
        next = next_reset_time(now, period, custom_seconds, end_time);
    }
    Some((last, next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp()
    }

    #[rstest]
    #[case(DurationUnit::Month, 1, ts(2025, 2, 28, 0))]
    #[case(DurationUnit::Year, 1, ts(2026, 1, 31, 0))]
    #[case(DurationUnit::Week, 2, ts(2025, 2, 14, 0))]
    #[case(DurationUnit::Day, 3, ts(2025, 2, 3, 0))]
    #[case(DurationUnit::Hour, 5, ts(2025, 1, 31, 5))]
    fn test_compute_end_time(#[case] unit: DurationUnit, #[case] value: i32, #[case] expected: i64) {
        assert_eq!(compute_end_time(ts(2025, 1, 31, 0), unit, value, 0), Some(expected));
    }

    #[test]
    fn test_invalid_durations() {
        assert_eq!(compute_end_time(0, DurationUnit::Day, 0, 0), None);
        assert_eq!(compute_end_time(0, DurationUnit::Custom, 1, 0), None);
        assert_eq!(compute_end_time(100, DurationUnit::Custom, 0, 60), Some(160));
    }

    #[test]
    fn test_calendar_boundaries() {
        // 2025-03-05 是星期三
        let base = ts(2025, 3, 5, 13);
        assert_eq!(next_reset_time(base, ResetPeriod::Daily, 0, 0), ts(2025, 3, 6, 0));
        assert_eq!(next_reset_time(base, ResetPeriod::Weekly, 0, 0), ts(2025, 3, 10, 0));
        assert_eq!(next_reset_time(base, ResetPeriod::Monthly, 0, 0), ts(2025, 4, 1, 0));
        assert_eq!(next_reset_time(base, ResetPeriod::Custom, 600, 0), base + 600);
        assert_eq!(next_reset_time(base, ResetPeriod::Never, 0, 0), 0);

        // 周一当天重置到下周一
        assert_eq!(
            next_reset_time(ts(2025, 3, 10, 0), ResetPeriod::Weekly, 0, 0),
            ts(2025, 3, 17, 0)
        );
    }

    #[test]
    fn test_boundary_capped_by_end_time() {
        let base = ts(2025, 3, 5, 13);
        assert_eq!(next_reset_time(base, ResetPeriod::Daily, 0, ts(2025, 3, 6, 0)), 0);
        assert_eq!(
            next_reset_time(base, ResetPeriod::Daily, 0, ts(2025, 3, 6, 1)),
            ts(2025, 3, 6, 0)
        );
    }

    #[test]
    fn test_catch_up_skips_missed_cycles() {
        let next = ts(2025, 3, 6, 0);
        let now = ts(2025, 3, 9, 12);
        assert_eq!(
            catch_up(next, ResetPeriod::Daily, 0, 0, now),
            Some((ts(2025, 3, 9, 0), ts(2025, 3, 10, 0)))
        );
        assert_eq!(catch_up(next, ResetPeriod::Daily, 0, 0, next - 1), None);
        assert_eq!(catch_up(0, ResetPeriod::Daily, 0, 0, now), None);
    }
}
