//! Regional bank lookup.
//!
//! The first eight characters of an ELBA identifier name the regional bank,
//! which has to be picked from the login form's dropdown.

/// Identifier prefix to dropdown label.
pub const REGIONS: [(&str, &str); 8] = [
    ("ELVIE33V", "Burgenland"),
    ("ELOOE03V", "Carinthia"),
    ("ELVIE32V", "Lower Austria"),
    ("ELOOE01V", "Upper Austria"),
    ("ELOOE05V", "Salzburg"),
    ("ELVIE38V", "Styria"),
    ("ELOOE11V", "Tyrol"),
    ("ELVIE37V", "Vorarlberg"),
];

/// Upper-cased first eight characters of the identifier.
pub fn region_prefix(identifier: &str) -> String {
    identifier.chars().take(8).collect::<String>().to_uppercase()
}

/// Dropdown label for an identifier, if its prefix is known.
pub fn region_for(identifier: &str) -> Option<&'static str> {
    let prefix = region_prefix(identifier);
    REGIONS
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, name)| *name)
}

/// Whether a dropdown option's text names `region`.
pub(crate) fn option_matches(option_text: &str, region: &str) -> bool {
    option_text.to_lowercase().contains(&region.to_lowercase())
}
