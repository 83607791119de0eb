use time::{macros::offset, Duration, OffsetDateTime, UtcOffset, Weekday};

/// Start-of-week rule: a weekday at local midnight under a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyBoundary {
    weekday: Weekday,
    offset: UtcOffset,
}

impl Default for WeeklyBoundary {
    fn default() -> Self {
        Self::seoul_monday()
    }
}

impl WeeklyBoundary {
    pub fn new(weekday: Weekday, offset: UtcOffset) -> Self {
        Self { weekday, offset }
    }

    /// Monday 00:00 at UTC+09:00.
    pub fn seoul_monday() -> Self {
        Self::new(Weekday::Monday, offset!(+9))
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Epoch milliseconds of the most recent boundary at or before `now_ms`.
    ///
    /// `None` only for instants outside the representable calendar range.
    pub fn week_start_ms(&self, now_ms: i64) -> Option<i64> {
        let now = OffsetDateTime::from_unix_timestamp(now_ms.div_euclid(1000))
            .ok()?
            .to_offset(self.offset);
        let today = now.date();
        let days_back = (7 + today.weekday().number_days_from_monday()
            - self.weekday.number_days_from_monday())
            % 7;
        let start = today.checked_sub(Duration::days(i64::from(days_back)))?;
        let boundary = start.midnight().assume_offset(self.offset);
        Some(boundary.unix_timestamp() * 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONDAY_KST: i64 = 1_760_281_200_000; // 2025-10-13T00:00:00+09:00
    const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

    #[test]
    fn midweek_maps_to_preceding_monday() {
        let thursday_afternoon = 1_760_596_200_000; // 2025-10-16T15:30:00+09:00
        assert_eq!(
            WeeklyBoundary::default().week_start_ms(thursday_afternoon),
            Some(MONDAY_KST)
        );
    }

    #[test]
    fn boundary_instant_is_its_own_week_start() {
        let boundary = WeeklyBoundary::seoul_monday();
        assert_eq!(boundary.week_start_ms(MONDAY_KST), Some(MONDAY_KST));
        assert_eq!(
            boundary.week_start_ms(MONDAY_KST - 1000),
            Some(MONDAY_KST - WEEK_MS)
        );
    }

    #[test]
    fn offset_decides_which_day_it_is() {
        // Monday 00:00 in Seoul is still Sunday afternoon in UTC
        let seoul = WeeklyBoundary::seoul_monday();
        let utc = WeeklyBoundary::new(Weekday::Monday, UtcOffset::UTC);

        assert_eq!(seoul.week_start_ms(1_760_886_000_000 - 1), Some(MONDAY_KST));
        assert_eq!(seoul.week_start_ms(1_760_886_000_000), Some(MONDAY_KST + WEEK_MS));
        assert_eq!(
            utc.week_start_ms(1_760_886_000_000),
            Some(1_760_313_600_000) // 2025-10-13T00:00:00Z
        );
    }

    #[test]
    fn other_weekdays_are_supported() {
        let friday = WeeklyBoundary::new(Weekday::Friday, offset!(+9));
        // Thursday 2025-10-16 belongs to the week that started Friday 2025-10-10
        assert_eq!(
            friday.week_start_ms(1_760_596_200_000),
            Some(MONDAY_KST - 3 * 24 * 60 * 60 * 1000)
        );
    }
}
