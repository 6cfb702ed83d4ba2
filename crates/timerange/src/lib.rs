//! Translation of relative date flags (`today`, `week`, `days=N`, weekday
//! names) and absolute timestamps into a concrete `[from, to]` pair in a
//! given time zone.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;

/// Raw time selection flags as they arrive on a request.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub from: Option<String>,
    pub to: Option<String>,
    pub today: bool,
    pub tomorrow: bool,
    pub week: bool,
    pub days: i64,
    pub week_start: Option<String>,
}

/// Offsets applied when `from`/`to` are not given explicitly.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub from_offset: Duration,
    pub to_offset: Duration,
    pub to_from_offset: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub from: DateTime<Tz>,
    pub to: DateTime<Tz>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeError {
    message: String,
}

impl RangeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RangeError {}

/// Resolves `flags` against `now` in `tz`. First match wins: `today`,
/// `tomorrow`, `week`, `days`, then independent `from`/`to` expressions
/// falling back to the supplied offsets.
pub fn resolve(
    now: DateTime<Utc>,
    tz: Tz,
    flags: &Flags,
    defaults: Defaults,
) -> Result<Range, RangeError> {
    let now = now.with_timezone(&tz);
    let week_start = resolve_week_start(flags.week_start.as_deref())?;

    let (from, to) = if flags.today {
        (start_of_day(&now)?, end_of_day(&now)?)
    } else if flags.tomorrow {
        let date = shift_date(&now, 1)?;
        (
            at_time(tz, date, 0, 0, 0, 0)?,
            at_time(tz, date, 23, 59, 59, 999_999_999)?,
        )
    } else if flags.week {
        (
            start_of_week(&now, week_start)?,
            end_of_week(&now, week_start)?,
        )
    } else if flags.days > 0 {
        let last = shift_date(&now, flags.days - 1)?;
        (
            start_of_day(&now)?,
            at_time(tz, last, 23, 59, 59, 999_999_999)?,
        )
    } else {
        let from = match flags.from.as_deref() {
            Some(expr) if !expr.trim().is_empty() => parse_time_expr(expr, &now, tz)
                .map_err(|err| RangeError::new(format!("invalid from: {err}")))?,
            _ => now + defaults.from_offset,
        };

        let to = match flags.to.as_deref() {
            Some(expr) if !expr.trim().is_empty() => parse_time_expr(expr, &now, tz)
                .map_err(|err| RangeError::new(format!("invalid to: {err}")))?,
            _ => {
                let has_from = flags
                    .from
                    .as_deref()
                    .map(|v| !v.trim().is_empty())
                    .unwrap_or(false);
                if has_from && defaults.to_from_offset != Duration::zero() {
                    from + defaults.to_from_offset
                } else {
                    now + defaults.to_offset
                }
            }
        };

        (from, to)
    };

    Ok(Range { from, to })
}

/// Parses a single time expression. Accepts RFC3339, `%Y-%m-%dT%H:%M:%S%z`,
/// the tokens `now`/`today`/`tomorrow`/`yesterday`, weekday names (plain =
/// next occurrence including today, `next <day>` = strictly next week), and
/// zone-local date/datetime forms.
pub fn parse_time_expr(expr: &str, now: &DateTime<Tz>, tz: Tz) -> Result<DateTime<Tz>, RangeError> {
    let expr = expr.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(expr) {
        return Ok(t.with_timezone(&tz));
    }
    if let Ok(t) = DateTime::parse_from_str(expr, "%Y-%m-%dT%H:%M:%S%z") {
        return Ok(t.with_timezone(&tz));
    }

    match expr.to_lowercase().as_str() {
        "now" => return Ok(*now),
        "today" => return start_of_day(now),
        "tomorrow" => return at_time(tz, shift_date(now, 1)?, 0, 0, 0, 0),
        "yesterday" => return at_time(tz, shift_date(now, -1)?, 0, 0, 0, 0),
        _ => {}
    }

    if let Some(t) = parse_weekday(&expr.to_lowercase(), now)? {
        return Ok(t);
    }

    if let Ok(date) = NaiveDate::parse_from_str(expr, "%Y-%m-%d") {
        return local_datetime(tz, date.and_time(NaiveTime::MIN));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(expr, "%Y-%m-%dT%H:%M:%S") {
        return local_datetime(tz, dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(expr, "%Y-%m-%d %H:%M") {
        return local_datetime(tz, dt);
    }

    Err(RangeError::new(format!("cannot parse {expr:?} as time")))
}

fn parse_weekday(expr: &str, now: &DateTime<Tz>) -> Result<Option<DateTime<Tz>>, RangeError> {
    let (next, name) = match expr.strip_prefix("next ") {
        Some(rest) => (true, rest.trim()),
        None => (false, expr),
    };

    let target = match name {
        "sunday" | "sun" => Weekday::Sun,
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        _ => return Ok(None),
    };

    let current = now.weekday().num_days_from_sunday() as i64;
    let wanted = target.num_days_from_sunday() as i64;
    let mut days_until = wanted - current;
    if days_until < 0 || (days_until == 0 && next) {
        days_until += 7;
    }
    let date = shift_date(now, days_until)?;
    Ok(Some(at_time(now.timezone(), date, 0, 0, 0, 0)?))
}

fn resolve_week_start(value: Option<&str>) -> Result<Weekday, RangeError> {
    let value = value.unwrap_or("").trim().to_lowercase();
    match value.as_str() {
        "" => Ok(Weekday::Mon),
        "sun" | "sunday" => Ok(Weekday::Sun),
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        other => Err(RangeError::new(format!("invalid week start {other:?}"))),
    }
}

fn start_of_day(t: &DateTime<Tz>) -> Result<DateTime<Tz>, RangeError> {
    at_time(t.timezone(), t.date_naive(), 0, 0, 0, 0)
}

fn end_of_day(t: &DateTime<Tz>) -> Result<DateTime<Tz>, RangeError> {
    at_time(t.timezone(), t.date_naive(), 23, 59, 59, 999_999_999)
}

fn start_of_week(t: &DateTime<Tz>, week_start: Weekday) -> Result<DateTime<Tz>, RangeError> {
    let days = (t.weekday().num_days_from_sunday() as i64
        - week_start.num_days_from_sunday() as i64
        + 7)
        % 7;
    at_time(t.timezone(), shift_date(t, -days)?, 0, 0, 0, 0)
}

fn end_of_week(t: &DateTime<Tz>, week_start: Weekday) -> Result<DateTime<Tz>, RangeError> {
    let start = start_of_week(t, week_start)?;
    at_time(t.timezone(), shift_date(&start, 6)?, 23, 59, 59, 999_999_999)
}

fn shift_date(t: &DateTime<Tz>, days: i64) -> Result<NaiveDate, RangeError> {
    t.date_naive()
        .checked_add_signed(Duration::days(days))
        .ok_or_else(|| RangeError::new("date out of range"))
}

fn at_time(
    tz: Tz,
    date: NaiveDate,
    hour: u32,
    min: u32,
    sec: u32,
    nano: u32,
) -> Result<DateTime<Tz>, RangeError> {
    let time = NaiveTime::from_hms_nano_opt(hour, min, sec, nano)
        .ok_or_else(|| RangeError::new("invalid time of day"))?;
    local_datetime(tz, date.and_time(time))
}

fn local_datetime(tz: Tz, dt: NaiveDateTime) -> Result<DateTime<Tz>, RangeError> {
    match tz.from_local_datetime(&dt) {
        LocalResult::Single(t) => Ok(t),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest),
        LocalResult::None => {
            // DST gap: the wall-clock time does not exist; slide forward to
            // the first hour that does.
            for hours in 1..=2 {
                if let LocalResult::Single(t) | LocalResult::Ambiguous(t, _) =
                    tz.from_local_datetime(&(dt + Duration::hours(hours)))
                {
                    return Ok(t);
                }
            }
            Err(RangeError::new(format!("time {dt} does not exist in zone")))
        }
    }
}
