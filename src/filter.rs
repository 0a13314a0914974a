use std::collections::HashMap;

/// Allow-list entry as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedCode {
    pub code: String,
    /// When set, the entry only matches rates published under this code type.
    pub code_type: Option<String>,
    pub label: Option<String>,
}

/// Pure predicate over (billing code, billing code type).
///
/// Codes are compared after trimming and ASCII upper-casing, code types
/// case-insensitively. An entry without a code type accepts any type.
#[derive(Debug, Clone, Default)]
pub struct CodeFilter {
    allowed: HashMap<String, Vec<AllowedCode>>,
}

impl CodeFilter {
    pub fn new(codes: impl IntoIterator<Item = AllowedCode>) -> Self {
        let mut allowed: HashMap<String, Vec<AllowedCode>> = HashMap::new();
        for entry in codes {
            let key = normalize_code(&entry.code);
            if key.is_empty() {
                continue;
            }
            allowed.entry(key).or_default().push(entry);
        }
        Self { allowed }
    }

    pub fn accepts(&self, billing_code: &str, billing_code_type: &str) -> bool {
        let Some(entries) = self.allowed.get(&normalize_code(billing_code)) else {
            return false;
        };
        let code_type = billing_code_type.trim();
        entries.iter().any(|entry| match entry.code_type.as_deref() {
            None => true,
            Some(wanted) => wanted.trim().eq_ignore_ascii_case(code_type),
        })
    }

    pub fn label(&self, billing_code: &str) -> Option<&str> {
        self.allowed
            .get(&normalize_code(billing_code))?
            .iter()
            .find_map(|entry| entry.label.as_deref())
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(code: &str, code_type: Option<&str>) -> AllowedCode {
        AllowedCode {
            code: code.to_string(),
            code_type: code_type.map(str::to_string),
            label: None,
        }
    }

    #[test]
    fn accepts_only_listed_codes() {
        let filter = CodeFilter::new([code("97110", None), code("97140", None)]);
        assert!(filter.accepts("97110", "CPT"));
        assert!(filter.accepts(" 97140 ", "HCPCS"));
        assert!(!filter.accepts("99999", "CPT"));
        assert!(!filter.accepts("", "CPT"));
    }

    #[test]
    fn typed_entries_require_matching_type() {
        let filter = CodeFilter::new([code("G0283", Some("hcpcs"))]);
        assert!(filter.accepts("g0283", "HCPCS"));
        assert!(!filter.accepts("G0283", "CPT"));
    }

    #[test]
    fn same_code_under_several_types() {
        let filter = CodeFilter::new([code("97110", Some("CPT")), code("97110", Some("HCPCS"))]);
        assert_eq!(filter.len(), 1);
        assert!(filter.accepts("97110", "cpt"));
        assert!(filter.accepts("97110", "HCPCS"));
        assert!(!filter.accepts("97110", "RC"));
    }

    #[test]
    fn labels_are_looked_up_by_normalized_code() {
        let filter = CodeFilter::new([AllowedCode {
            code: "97110".to_string(),
            code_type: None,
            label: Some("Therapeutic exercise".to_string()),
        }]);
        assert_eq!(filter.label(" 97110"), Some("Therapeutic exercise"));
        assert_eq!(filter.label("97112"), None);
    }

    #[test]
    fn blank_codes_are_ignored() {
        let filter = CodeFilter::new([code("  ", None)]);
        assert!(filter.is_empty());
    }
}
