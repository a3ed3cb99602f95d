//! Plate text normalization and category matching.
//!
//! Raw OCR text is uppercased, stripped of spaces and mapped from visually
//! identical Latin letters onto the Cyrillic registration alphabet, then
//! matched against the category patterns in declaration order. First match
//! wins.

use std::fmt;

use once_cell::sync::Lazy;
use phf::phf_map;
use regex::Regex;

/// Registration plate category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateKind {
    Civil,
    Taxi,
    Transport,
    Motorcycle,
    Military,
    Diplomatic,
    Transit,
    Foreign,
}

impl PlateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlateKind::Civil => "civil",
            PlateKind::Taxi => "taxi",
            PlateKind::Transport => "transport",
            PlateKind::Motorcycle => "motorcycle",
            PlateKind::Military => "military",
            PlateKind::Diplomatic => "diplomatic",
            PlateKind::Transit => "transit",
            PlateKind::Foreign => "foreign",
        }
    }
}

impl fmt::Display for PlateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static LAT_TO_CYR: phf::Map<char, char> = phf_map! {
    'A' => 'А',
    'B' => 'В',
    'E' => 'Е',
    'K' => 'К',
    'M' => 'М',
    'H' => 'Н',
    'O' => 'О',
    'P' => 'Р',
    'C' => 'С',
    'T' => 'Т',
    'X' => 'Х',
};

// Match order is significant: broader patterns that share a prefix with a
// narrower one must keep their relative position.
static PLATE_PATTERNS: Lazy<Vec<(PlateKind, Regex)>> = Lazy::new(|| {
    [
        (PlateKind::Civil, r"^[АВЕКМНОРСТУХ]{1}\d{3}[АВЕКМНОРСТУХ]{2}\d{2,3}$"),
        (PlateKind::Taxi, r"^[АВЕКМНОРСТУХ]{1}\d{3}ТХ\d{2,3}$"),
        (PlateKind::Transport, r"^[АВЕКМНОРСТУХ]{1}\d{3}[ГТБ]{1}\d{2,3}$"),
        (PlateKind::Motorcycle, r"^[АВЕКМНОРСТУХ]{1}\d{3}Х\d{2,3}$"),
        (PlateKind::Military, r"^М\d{4}[АВЕКМНОРСТУХ]{2}$"),
        (PlateKind::Diplomatic, r"^\d{3,4} [АВЕКМНОРСТУХ]{2}$"),
        (PlateKind::Transit, r"^Т\d{3}[АВЕКМНОРСТУХ]{2}\d{2,3}$"),
        (PlateKind::Foreign, r"^[A-Z]{2}\d{4}[A-Z]{2}$"),
    ]
    .into_iter()
    .map(|(kind, patt)| (kind, Regex::new(patt).expect("static pattern")))
    .collect()
});

/// Uppercase, drop spaces, replace look-alike Latin letters with Cyrillic.
pub fn normalize_plate(s: &str) -> String {
    s.to_uppercase()
        .chars()
        .filter(|c| *c != ' ')
        .map(|c| LAT_TO_CYR.get(&c).copied().unwrap_or(c))
        .collect()
}

/// Classify `text` after normalization. None when no pattern matches.
pub fn classify_plate(text: &str) -> Option<(PlateKind, String)> {
    let t = normalize_plate(text);
    for (kind, patt) in PLATE_PATTERNS.iter() {
        if patt.is_match(&t) {
            return Some((*kind, t));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin_input_normalizes_to_cyrillic() {
        assert_eq!(normalize_plate("A123BC77"), "А123ВС77");
        assert_eq!(normalize_plate("a 123 bc 77"), "А123ВС77");
        assert_eq!(normalize_plate("М456ЕЕ199"), "М456ЕЕ199");
    }

    #[test]
    fn civil_plate_from_latin_ocr_text() {
        let (kind, text) = classify_plate("A123BC77").unwrap();
        assert_eq!(kind, PlateKind::Civil);
        assert_eq!(text, "А123ВС77");
    }

    #[test]
    fn single_letter_series_categories() {
        assert_eq!(classify_plate("А123Г77").unwrap().0, PlateKind::Transport);
        assert_eq!(classify_plate("a123x77").unwrap().0, PlateKind::Motorcycle);
    }

    #[test]
    fn military_and_foreign_plates() {
        assert_eq!(classify_plate("M1234AB").unwrap().0, PlateKind::Military);
        // letters with no Cyrillic look-alike survive normalization as Latin
        assert_eq!(classify_plate("DF1234GL").unwrap().0, PlateKind::Foreign);
    }

    #[test]
    fn unmatched_text_returns_none() {
        assert!(classify_plate("").is_none());
        assert!(classify_plate("HELLO").is_none());
        assert!(classify_plate("1234567").is_none());
    }

    #[test]
    fn normalization_is_idempotent() {
        for s in ["A123BC77", "а 123 вс 77", "M1234AB", "DF1234GL", "xyz"] {
            let once = normalize_plate(s);
            assert_eq!(normalize_plate(&once), once);
        }
    }

    #[test]
    fn overlapping_patterns_resolve_in_declaration_order() {
        // АxxxТХxx matches both civil and taxi; ТxxxLLxx both civil and
        // transit. civil is declared first and must win every time.
        for _ in 0..3 {
            assert_eq!(classify_plate("А123ТХ77").unwrap().0, PlateKind::Civil);
            assert_eq!(classify_plate("Т123АВ77").unwrap().0, PlateKind::Civil);
        }
    }
}
