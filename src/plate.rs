use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    // Tried in order; first match wins. The final variant is only reachable
    // for plates longer than the length gate admits, but the table order is
    // part of the contract and is kept as-is.
    static ref PLATE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z]{2}[0-9]{4}$").unwrap(),
        Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z]{1}[0-9]{4}$").unwrap(),
        Regex::new(r"^[A-Z]{2}[0-9]{2}[0-9]{4}$").unwrap(),
        Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z]{1}[0-9]{4}$").unwrap(),
        Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z]{3}[0-9]{4}$").unwrap(),
    ];
}

const DEFAULT_REGION_CODES: [&str; 37] = [
    "AN", "AP", "AR", "AS", "BR", "CG", "CH", "DD", "DL", "DN", "GA", "GJ",
    "HP", "HR", "JH", "JK", "KA", "KL", "LA", "LD", "MH", "ML", "MN", "MP",
    "MZ", "NL", "OD", "PB", "PY", "RJ", "SK", "TN", "TR", "TS", "UK", "UP",
    "WB",
];

/// Turns raw OCR text into the canonical space-grouped plate string, or
/// rejects it. Pure; rejection is `None`, never an error.
pub struct PlateNormalizer {
    regions: HashSet<String>,
}

impl Default for PlateNormalizer {
    fn default() -> Self {
        Self {
            regions: DEFAULT_REGION_CODES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl PlateNormalizer {
    /// Replaces the built-in region-code set, e.g. from configuration.
    pub fn with_regions(codes: &[String]) -> Self {
        Self {
            regions: codes.iter().map(|c| c.to_uppercase()).collect(),
        }
    }

    pub fn normalize(&self, raw: &str) -> Option<String> {
        let plate: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .to_uppercase();

        let len = plate.chars().count();
        if len < 8 || len > 10 {
            return None;
        }

        let region: String = plate.chars().take(2).collect();
        if !self.regions.contains(&region) {
            return None;
        }

        if !PLATE_PATTERNS.iter().any(|p| p.is_match(&plate)) {
            return None;
        }

        // A match guarantees ASCII, so byte indexing below is safe. The
        // grouped form is the canonical representation stored and compared
        // everywhere downstream.
        Some(match plate.len() {
            10 => format!("{} {} {} {}", &plate[..2], &plate[2..4], &plate[4..6], &plate[6..]),
            9 => format!("{} {} {} {}", &plate[..2], &plate[2..4], &plate[4..5], &plate[5..]),
            _ => format!("{} {} {}", &plate[..2], &plate[2..4], &plate[4..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> PlateNormalizer {
        PlateNormalizer::default()
    }

    #[test]
    fn groups_ten_character_plate() {
        assert_eq!(
            normalizer().normalize("MH12AB1234"),
            Some("MH 12 AB 1234".to_string())
        );
    }

    #[test]
    fn groups_nine_character_plate() {
        assert_eq!(
            normalizer().normalize("DL04C9876"),
            Some("DL 04 C 9876".to_string())
        );
    }

    #[test]
    fn groups_eight_character_plate() {
        assert_eq!(
            normalizer().normalize("KA051234"),
            Some("KA 05 1234".to_string())
        );
    }

    #[test]
    fn strips_separators_and_case() {
        assert_eq!(
            normalizer().normalize(" mh-12 ab 1234 "),
            Some("MH 12 AB 1234".to_string())
        );
    }

    #[test]
    fn canonical_form_is_idempotent() {
        let n = normalizer();
        for raw in &["MH12AB1234", "DL04C9876", "KA051234"] {
            let canonical = n.normalize(raw).unwrap();
            assert_eq!(n.normalize(&canonical), Some(canonical.clone()));
        }
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        let n = normalizer();
        assert_eq!(n.normalize("MH1234"), None);
        assert_eq!(n.normalize("MH12AB123456"), None);
        // The three-letter series form is eleven characters and falls to the
        // length gate before any pattern is consulted.
        assert_eq!(n.normalize("MH12ABC1234"), None);
    }

    #[test]
    fn rejects_unknown_region_code() {
        assert_eq!(normalizer().normalize("XX99ZZ0000"), None);
    }

    #[test]
    fn rejects_unknown_region_despite_valid_structure() {
        assert_eq!(normalizer().normalize("QQ12AB1234"), None);
    }

    #[test]
    fn rejects_malformed_body() {
        let n = normalizer();
        assert_eq!(n.normalize("MH12341234"), None);
        assert_eq!(n.normalize("MHAB121234"), None);
        assert_eq!(n.normalize("MH12ABCDEF"), None);
    }

    #[test]
    fn rejects_non_ascii_noise() {
        assert_eq!(normalizer().normalize("MH１２AB1234"), None);
    }

    #[test]
    fn custom_region_set_replaces_default() {
        let n = PlateNormalizer::with_regions(&["zz".to_string()]);
        assert_eq!(n.normalize("ZZ12AB1234"), Some("ZZ 12 AB 1234".to_string()));
        assert_eq!(n.normalize("MH12AB1234"), None);
    }
}
