//! Date/time codec for the host clock commands.
//!
//! The real-time clock counts seconds since midnight, January 1st 1980.
//! The four-year leap cycle arithmetic is exact through February 28th
//! 2100 (2100 is not a leap year, which breaks the cycle).

const SECONDS_IN_HOUR: u32 = 3600;
const SECONDS_IN_DAY: u32 = 86_400;
const SECONDS_IN_YEAR: u32 = 31_536_000; // 365 days
const DAYS_IN_FOUR_YEARS: u32 = 1461;

const NORMAL_YEAR_DAYS_TO_MONTH: [u32; 12] =
    [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
const LEAP_YEAR_DAYS_TO_MONTH: [u32; 12] =
    [0, 31, 60, 91, 121, 152, 182, 213, 244, 274, 305, 335];

/// Broken-down date and time. All fields are zero based: `year` counts
/// from 1980, `month` 0-11, `day` 0-30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTime {
    pub sec: u32,
    pub min: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub year: u32,
}

/// Break a seconds-since-1980 count into calendar fields.
#[must_use]
pub fn code_datetime(seconds: u32) -> DateTime {
    let mut dt = DateTime::default();

    let mut num_days = seconds / SECONDS_IN_DAY;
    let day_time = seconds % SECONDS_IN_DAY;
    dt.hour = day_time / SECONDS_IN_HOUR;
    let balance = day_time % SECONDS_IN_HOUR;
    dt.min = balance / 60;
    dt.sec = balance % 60;

    // 1980 is a leap year, so each four-year cycle is leap-first: 366
    // days, then three years of 365.
    let leap_cycles = num_days / DAYS_IN_FOUR_YEARS;
    num_days %= DAYS_IN_FOUR_YEARS;

    let (year_in_cycle, day_of_year, table) = if num_days < 366 {
        (0, num_days, &LEAP_YEAR_DAYS_TO_MONTH)
    } else {
        let d = num_days - 366;
        (1 + d / 365, d % 365, &NORMAL_YEAR_DAYS_TO_MONTH)
    };
    dt.year = year_in_cycle + leap_cycles * 4;

    let mut month = 11;
    while table[month] > day_of_year {
        month -= 1;
    }
    dt.month = month as u32;
    dt.day = day_of_year - table[month];

    dt
}

/// Rebuild the seconds-since-1980 count from calendar fields.
#[must_use]
pub fn encode_datetime(dt: &DateTime) -> u32 {
    let mut time = dt.year * SECONDS_IN_YEAR;
    // One extra day for each completed leap year in the cycle.
    time += dt.year.div_ceil(4) * SECONDS_IN_DAY;

    let table = if (dt.year + 1980) % 4 == 0 {
        &LEAP_YEAR_DAYS_TO_MONTH
    } else {
        &NORMAL_YEAR_DAYS_TO_MONTH
    };
    time += table[dt.month.min(11) as usize] * SECONDS_IN_DAY;

    time += dt.day * SECONDS_IN_DAY;
    time += dt.hour * SECONDS_IN_HOUR;
    time += dt.min * 60;
    time += dt.sec;
    time
}

/// Parse `MM/DD/YYYY HH:MM:SS` (two-digit years are widened with a 1980
/// pivot). Fields left unparsed default to their earliest value.
#[must_use]
pub fn parse_datetime(text: &str) -> DateTime {
    let mut dt = DateTime::default();

    let mut rest = text.trim();
    dt.month = lead_number(rest).saturating_sub(1).min(11);

    let Some(after_month) = rest.split_once('/') else {
        return dt;
    };
    rest = after_month.1;
    dt.day = lead_number(rest).saturating_sub(1).min(30);

    let Some(after_day) = rest.split_once('/') else {
        return dt;
    };
    rest = after_day.1;
    let mut year = lead_number(rest);
    if year < 100 {
        year += if year >= 80 { 1900 } else { 2000 };
    }
    dt.year = year.saturating_sub(1980);

    let Some(after_year) = rest.split_once(' ') else {
        return dt;
    };
    rest = after_year.1;
    dt.hour = lead_number(rest).min(23);

    let Some(after_hour) = rest.split_once(':') else {
        return dt;
    };
    rest = after_hour.1;
    dt.min = lead_number(rest).min(59);

    let Some(after_min) = rest.split_once(':') else {
        return dt;
    };
    dt.sec = lead_number(after_min.1).min(59);

    dt
}

/// Format as `MM/DD/YYYY` (directory listings).
#[must_use]
pub fn format_date(dt: &DateTime) -> String {
    format!(
        "{:02}/{:02}/{}",
        dt.month + 1,
        dt.day + 1,
        dt.year + 1980
    )
}

/// Format as `MM/DD/YY HH:MM:SS` (the get-time host command).
#[must_use]
pub fn format_datetime(dt: &DateTime) -> String {
    format!(
        "{:02}/{:02}/{:02} {:02}:{:02}:{:02}",
        dt.month + 1,
        dt.day + 1,
        (dt.year + 1980) % 100,
        dt.hour,
        dt.min,
        dt.sec
    )
}

fn lead_number(text: &str) -> u32 {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_new_year_1980() {
        let dt = code_datetime(0);
        assert_eq!((dt.year, dt.month, dt.day), (0, 0, 0));
        assert_eq!((dt.hour, dt.min, dt.sec), (0, 0, 0));
    }

    #[test]
    fn leap_day_1980() {
        // Feb 29 1980 = day 59 of a leap year.
        let dt = code_datetime(59 * 86_400);
        assert_eq!((dt.year, dt.month, dt.day), (0, 1, 28));
    }

    #[test]
    fn leap_year_tail_and_boundary() {
        // Dec 31 1980 is day 365 of the leap-first cycle.
        let dt = code_datetime(365 * 86_400);
        assert_eq!((dt.year, dt.month, dt.day), (0, 11, 30));
        // Jan 1 1981 follows the 366-day year.
        let dt = code_datetime(366 * 86_400);
        assert_eq!((dt.year, dt.month, dt.day), (1, 0, 0));
    }

    #[test]
    fn encode_code_roundtrip_across_range() {
        // Sampled times between 1980 and early 2100, stepped by a prime
        // number of seconds so every field varies.
        let limit = code_to_seconds(120, 1, 0); // Feb 1 2100
        let mut t: u32 = 0;
        while t < limit {
            let dt = code_datetime(t);
            assert_eq!(encode_datetime(&dt), t, "roundtrip at {t}");
            t = t.saturating_add(86_399 * 37 + 17);
        }
    }

    fn code_to_seconds(year: u32, month: u32, day: u32) -> u32 {
        encode_datetime(&DateTime {
            year,
            month,
            day,
            ..DateTime::default()
        })
    }

    #[test]
    fn parse_full_timestamp() {
        let dt = parse_datetime("06/15/1994 13:45:09");
        assert_eq!((dt.month, dt.day, dt.year), (5, 14, 14));
        assert_eq!((dt.hour, dt.min, dt.sec), (13, 45, 9));
    }

    #[test]
    fn parse_two_digit_year_pivots() {
        assert_eq!(parse_datetime("01/01/85 00:00:00").year, 5);
        assert_eq!(parse_datetime("01/01/05 00:00:00").year, 25);
    }

    #[test]
    fn parse_roundtrips_through_format() {
        let dt = parse_datetime("02/28/2096 23:59:58");
        let again = code_datetime(encode_datetime(&dt));
        assert_eq!(dt, again);
        assert_eq!(format_datetime(&again), "02/28/96 23:59:58");
    }

    #[test]
    fn date_format_for_listings() {
        let dt = parse_datetime("11/03/2024 08:00:00");
        assert_eq!(format_date(&dt), "11/03/2024");
    }
}
