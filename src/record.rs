use serde::{Deserialize, Serialize};

/// One scraped admissions profile. `id` is the dedup key; every other field
/// is optional because extraction is best-effort per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub acceptance_rate: Option<String>,
    pub institution: Option<String>,
    pub program: Option<String>,
    pub degree_type: Option<String>,
    pub degree_country: Option<String>,
    pub decision: Option<String>,
    pub notification_date: Option<String>,
    pub notification_method: Option<String>,
    pub undergrad_gpa: Option<f64>,
    pub gre_general: Option<i64>,
    pub gre_verbal: Option<i64>,
    pub analytical_writing: Option<f64>,
    pub notes: Option<String>,
    pub timeline_event: Option<String>,
    pub timeline_date: Option<String>,
    #[serde(rename = "scraped_timestamp")]
    pub scraped_at: Option<String>,
}

/// Output store header, in column order. Must stay in sync with the struct.
pub const COLUMNS: [&str; 17] = [
    "id",
    "acceptance_rate",
    "institution",
    "program",
    "degree_type",
    "degree_country",
    "decision",
    "notification_date",
    "notification_method",
    "undergrad_gpa",
    "gre_general",
    "gre_verbal",
    "analytical_writing",
    "notes",
    "timeline_event",
    "timeline_date",
    "scraped_timestamp",
];

impl Record {
    /// Partial record carrying only the dedup key. Valid to store as-is.
    pub fn with_id(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            acceptance_rate: None,
            institution: None,
            program: None,
            degree_type: None,
            degree_country: None,
            decision: None,
            notification_date: None,
            notification_method: None,
            undergrad_gpa: None,
            gre_general: None,
            gre_verbal: None,
            analytical_writing: None,
            notes: None,
            timeline_event: None,
            timeline_date: None,
            scraped_at: None,
        }
    }
}

// ── Field cleaning ──

/// GPA as reported, or None for the site's placeholder values.
pub fn clean_gpa(raw: &str) -> Option<f64> {
    let v = raw.trim();
    if matches!(v, "" | "0" | "0.00" | "N/A") {
        return None;
    }
    v.parse::<f64>().ok()
}

/// GRE section score, or None for placeholders and non-numeric text.
pub fn clean_gre(raw: &str) -> Option<i64> {
    let v = raw.trim();
    if matches!(v, "" | "0" | "N/A") {
        return None;
    }
    v.parse::<i64>().ok()
}

/// Analytical writing score, same placeholder rules as GPA.
pub fn clean_writing(raw: &str) -> Option<f64> {
    clean_gpa(raw)
}

/// Split "Accepted on 15 Mar via E-mail" style notification text into
/// (date, method). Text without "via" is all date.
pub fn split_notification(raw: &str) -> (Option<String>, Option<String>) {
    let v = raw.trim();
    if v.is_empty() {
        return (None, None);
    }
    match v.split_once(" via ") {
        Some((date, method)) => {
            let date = date.trim_start_matches("on ").replace(" on ", " ");
            (
                Some(date.trim().to_string()),
                Some(format!("via {}", method.trim())),
            )
        }
        None => (Some(v.to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpa_placeholders_are_none() {
        assert_eq!(clean_gpa("0.00"), None);
        assert_eq!(clean_gpa("0"), None);
        assert_eq!(clean_gpa("N/A"), None);
        assert_eq!(clean_gpa(""), None);
        assert_eq!(clean_gpa("3.85"), Some(3.85));
        assert_eq!(clean_gpa("four"), None);
    }

    #[test]
    fn gre_parses_or_drops() {
        assert_eq!(clean_gre("328"), Some(328));
        assert_eq!(clean_gre("0"), None);
        assert_eq!(clean_gre("N/A"), None);
        assert_eq!(clean_gre("good"), None);
    }

    #[test]
    fn notification_splits_on_via() {
        let (date, method) = split_notification("Accepted on 15 Mar 2025 via E-mail");
        assert_eq!(date.as_deref(), Some("Accepted 15 Mar 2025"));
        assert_eq!(method.as_deref(), Some("via E-mail"));

        let (date, method) = split_notification("15 Mar 2025");
        assert_eq!(date.as_deref(), Some("15 Mar 2025"));
        assert_eq!(method, None);
    }

    #[test]
    fn id_only_record_keeps_key() {
        let r = Record::with_id("12345");
        assert_eq!(r.id, "12345");
        assert!(r.institution.is_none());
    }
}
