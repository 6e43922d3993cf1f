use chrono::Local;

/// Minute-precision ISO-8601 local time with offset, e.g. `2026-03-04T09:15+01:00`.
#[must_use]
pub fn now_iso_minutes() -> String {
    Local::now().format("%Y-%m-%dT%H:%M%:z").to_string()
}

/// Today's local date as `YYYY-MM-DD`, the format of step and stage completion dates.
#[must_use]
pub fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats() {
        assert!(chrono::NaiveDate::parse_from_str(&today(), "%Y-%m-%d").is_ok());
        let ts = now_iso_minutes();
        assert_eq!(ts.len(), "2026-03-04T09:15+01:00".len());
        assert!(chrono::DateTime::parse_from_str(&format!("{}:00{}", &ts[..16], &ts[16..]), "%Y-%m-%dT%H:%M:%S%:z").is_ok());
    }
}
