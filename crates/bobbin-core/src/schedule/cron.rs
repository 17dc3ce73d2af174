//! Translation from classic 5-field cron to the `cron` crate's syntax.
//!
//! The `cron` crate wants a leading seconds field and numbers weekdays 1-7
//! starting at Sunday, while classic cron numbers them 0-7 with both 0 and 7
//! meaning Sunday. Numeric weekdays are therefore rewritten to names, which
//! both dialects agree on.

use std::collections::BTreeSet;

use crate::error::BobbinError;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// `"0 2 * * 1-5"` -> `"0 0 2 * * MON,TUE,WED,THU,FRI"`.
///
/// `@daily` style macros pass through untouched.
pub fn to_cron_crate_syntax(expression: &str) -> Result<String, BobbinError> {
    let expression = expression.trim();
    if expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
        return Err(invalid(expression, "expected 5 fields"));
    };
    let day_of_week = translate_day_of_week(day_of_week)
        .map_err(|reason| invalid(expression, &reason))?;

    Ok(format!("0 {minute} {hour} {day_of_month} {month} {day_of_week}"))
}

fn invalid(expression: &str, reason: &str) -> BobbinError {
    BobbinError::InvalidSchedule(format!("bad cron expression `{expression}`: {reason}"))
}

fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut out: Vec<String> = Vec::new();
    let mut days: BTreeSet<usize> = BTreeSet::new();

    for item in field.split(',') {
        match item {
            "*" | "?" => out.push(item.to_string()),
            // `*/n` は両方の方言で同じ曜日集合になる
            _ if item.starts_with("*/") => out.push(item.to_string()),
            _ => match expand(item)? {
                Some(expanded) => days.extend(expanded),
                None => out.push(item.to_string()),
            },
        }
    }

    out.extend(days.into_iter().map(|d| WEEKDAYS[d].to_string()));
    if out.is_empty() {
        return Err("empty day-of-week field".to_string());
    }
    Ok(out.join(","))
}

/// Expands a numeric item (`3`, `1-5`, `1-5/2`, `2/3`) into weekday indexes.
/// Returns `None` for name-based items, which are left for the parser.
fn expand(item: &str) -> Result<Option<Vec<usize>>, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: usize = step
                .parse()
                .map_err(|_| format!("bad step in `{item}`"))?;
            if step == 0 {
                return Err(format!("zero step in `{item}`"));
            }
            (range, step)
        }
        None => (item, 1),
    };

    let (start, end) = match range.split_once('-') {
        Some((a, b)) => (a, Some(b)),
        None => (range, None),
    };
    let Ok(start) = start.parse::<usize>() else {
        return Ok(None);
    };
    let end = match end {
        Some(end) => end
            .parse::<usize>()
            .map_err(|_| format!("mixed names and numbers in `{item}`"))?,
        // `a/n` means from a to the end of the week
        None if item.contains('/') => 7,
        None => start,
    };

    if start > 7 || end > 7 {
        return Err(format!("weekday out of range in `{item}`"));
    }
    if start > end {
        return Err(format!("wrapped weekday range `{item}`"));
    }
    Ok(Some((start..=end).step_by(step).map(|d| d % 7).collect()))
}
