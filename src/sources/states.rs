//! The 51 jurisdictions (50 states + DC) used as entity keys.

/// (postal code, FIPS code, name)
pub const JURISDICTIONS: [(&str, &str, &str); 51] = [
    ("AL", "01", "Alabama"),
    ("AK", "02", "Alaska"),
    ("AZ", "04", "Arizona"),
    ("AR", "05", "Arkansas"),
    ("CA", "06", "California"),
    ("CO", "08", "Colorado"),
    ("CT", "09", "Connecticut"),
    ("DE", "10", "Delaware"),
    ("DC", "11", "District of Columbia"),
    ("FL", "12", "Florida"),
    ("GA", "13", "Georgia"),
    ("HI", "15", "Hawaii"),
    ("ID", "16", "Idaho"),
    ("IL", "17", "Illinois"),
    ("IN", "18", "Indiana"),
    ("IA", "19", "Iowa"),
    ("KS", "20", "Kansas"),
    ("KY", "21", "Kentucky"),
    ("LA", "22", "Louisiana"),
    ("ME", "23", "Maine"),
    ("MD", "24", "Maryland"),
    ("MA", "25", "Massachusetts"),
    ("MI", "26", "Michigan"),
    ("MN", "27", "Minnesota"),
    ("MS", "28", "Mississippi"),
    ("MO", "29", "Missouri"),
    ("MT", "30", "Montana"),
    ("NE", "31", "Nebraska"),
    ("NV", "32", "Nevada"),
    ("NH", "33", "New Hampshire"),
    ("NJ", "34", "New Jersey"),
    ("NM", "35", "New Mexico"),
    ("NY", "36", "New York"),
    ("NC", "37", "North Carolina"),
    ("ND", "38", "North Dakota"),
    ("OH", "39", "Ohio"),
    ("OK", "40", "Oklahoma"),
    ("OR", "41", "Oregon"),
    ("PA", "42", "Pennsylvania"),
    ("RI", "44", "Rhode Island"),
    ("SC", "45", "South Carolina"),
    ("SD", "46", "South Dakota"),
    ("TN", "47", "Tennessee"),
    ("TX", "48", "Texas"),
    ("UT", "49", "Utah"),
    ("VT", "50", "Vermont"),
    ("VA", "51", "Virginia"),
    ("WA", "53", "Washington"),
    ("WV", "54", "West Virginia"),
    ("WI", "55", "Wisconsin"),
    ("WY", "56", "Wyoming"),
];

pub fn postal_codes() -> impl Iterator<Item = &'static str> {
    JURISDICTIONS.iter().map(|(code, _, _)| *code)
}

pub fn from_fips(fips: &str) -> Option<&'static str> {
    let fips = fips.trim();
    let padded;
    let fips = if fips.len() == 1 {
        padded = format!("0{}", fips);
        padded.as_str()
    } else {
        fips
    };
    JURISDICTIONS
        .iter()
        .find(|(_, f, _)| *f == fips)
        .map(|(code, _, _)| *code)
}

/// Resolve a postal code, FIPS code, or full name to a postal code.
pub fn resolve(raw: &str) -> Option<&'static str> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return from_fips(raw);
    }
    JURISDICTIONS
        .iter()
        .find(|(code, _, name)| code.eq_ignore_ascii_case(raw) || name.eq_ignore_ascii_case(raw))
        .map(|(code, _, _)| *code)
}
