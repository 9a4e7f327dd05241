//! Text normalization shared by both parsers.

use std::sync::OnceLock;

use regex::Regex;
use scraper::Html;

/// Romanian phenomenon keys, matched in this order as substrings of the
/// uppercased description.
const CONDITION_TABLE: &[(&str, &str)] = &[
    ("CER SENIN", "Clear Sky"),
    ("CER VARIABIL", "Partly Cloudy"),
    ("CER PARTIAL NOROS", "Partly Cloudy"),
    ("CER MAI MULT NOROS", "Mostly Cloudy"),
    ("CER NOROS", "Cloudy"),
    ("INNNORAT", "Overcast"),
    ("PLOAIE SLABA", "Light Rain"),
    ("PLOAIE", "Rain"),
    ("PLOAIE MODERATA", "Moderate Rain"),
    ("PLOI", "Rainy"),
    ("AVERSE", "Showers"),
    ("FURTUNA", "Thunderstorm"),
    ("NINSOARE SLABA", "Light Snow"),
    ("NINSOARE", "Snow"),
    ("NINSOARE MODERATA", "Moderate Snow"),
    ("LAPOVITA", "Sleet"),
    ("CEATA", "Fog"),
    ("BURNITA", "Drizzle"),
];

/// Translate a Romanian condition description into English.
///
/// Every table key found in the input contributes its English label, so
/// compound descriptions such as "Ploaie slaba si ceata" yield
/// "Light Rain, Rain, Fog". Input with no known key is title-cased.
pub fn translate_conditions(romanian: &str) -> String {
    if romanian.is_empty() {
        return "Unknown".to_string();
    }

    let upper = romanian.to_uppercase();
    let parts = CONDITION_TABLE
        .iter()
        .filter(|(ro, _)| upper.contains(ro))
        .map(|(_, en)| *en)
        .collect::<Vec<_>>();

    if parts.is_empty() {
        title_case(romanian)
    } else {
        parts.join(", ")
    }
}

/// Uppercase the first letter of every alphabetic run, lowercase the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_word = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

/// Drop markup, decode entities and collapse whitespace to single spaces.
pub fn clean_markup(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(text);
    let joined = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    whitespace_re().replace_all(&joined, " ").trim().to_string()
}

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_compound_conditions() {
        assert_eq!(translate_conditions("Cer senin"), "Clear Sky");
        assert_eq!(translate_conditions("CER VARIABIL"), "Partly Cloudy");
        assert_eq!(
            translate_conditions("Ploaie slaba si ceata"),
            "Light Rain, Rain, Fog"
        );
        assert_eq!(translate_conditions("ninsoare moderata"), "Snow, Moderate Snow");
    }

    #[test]
    fn empty_and_unknown_conditions() {
        assert_eq!(translate_conditions(""), "Unknown");
        assert_eq!(translate_conditions("vant puternic"), "Vant Puternic");
        assert_eq!(translate_conditions("Strong Wind"), "Strong Wind");
        assert_eq!(
            translate_conditions(&translate_conditions("sunny SPELLS")),
            "Sunny Spells"
        );
    }

    #[test]
    fn title_case_breaks_on_non_letters() {
        assert_eq!(title_case("o'neil 2nd-day"), "O'Neil 2Nd-Day");
        assert_eq!(title_case("ÎNNORAT"), "Înnorat");
    }

    #[test]
    fn markup_is_stripped_and_entities_decoded() {
        assert_eq!(
            clean_markup("<p>Cod galben</p><br/>In zona&nbsp;: jud. Ia&#351;i"),
            "Cod galben In zona : jud. Iaşi"
        );
        assert_eq!(clean_markup("  a \n\t b  "), "a b");
        assert_eq!(clean_markup(""), "");
        assert_eq!(clean_markup("&icirc;n &ndash; vest"), "în – vest");
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("şşşş", 2), "şş");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
