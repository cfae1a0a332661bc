//! Locale-aware conversion of raw cell text into numbers.

use crate::{CanonicalNumber, Currency, CurrencyTaggedValue};

/// Spreadsheet error markers that stand for "no value".
pub const ERROR_TOKENS: [&str; 5] = ["#DIV/0!", "#N/A", "#VALUE!", "#REF!", "#NAME?"];

/// Locale-formatted zero substituted for blanks and error markers.
pub const ZERO_TEXT: &str = "0,00";

/// Trims the cell and maps blanks and error tokens to [`ZERO_TEXT`].
pub fn clean_cell(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.is_empty() || ERROR_TOKENS.contains(&trimmed) {
        ZERO_TEXT
    } else {
        trimmed
    }
}

pub fn normalize(raw: &str) -> CanonicalNumber {
    let cleaned = clean_cell(raw);
    CanonicalNumber {
        value: parse_locale_number(cleaned),
        source: cleaned.to_string(),
    }
}

/// `$` without `R$` is foreign currency; everything else is local.
pub fn classify_currency(raw: &str) -> Currency {
    if raw.contains('$') && !raw.contains("R$") {
        Currency::Usd
    } else {
        Currency::Brl
    }
}

pub fn normalize_currency(raw: &str) -> CurrencyTaggedValue {
    CurrencyTaggedValue {
        number: normalize(raw),
        currency: classify_currency(raw),
    }
}

/// Parses pt-BR style numbers (`R$ -1.234,56`, `1,85`, `12%`). Never fails: text
/// without digits is `0.0`.
pub fn parse_locale_number(text: &str) -> f64 {
    let stripped: String = text
        .replace("R$", "")
        .replace("US$", "")
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '$' | '%'))
        .collect();

    let Some(start) = stripped.find(|c: char| c.is_ascii_digit()) else {
        return 0.0;
    };
    let negative = stripped[..start].ends_with(['-', '\u{2212}']);

    let body: String = stripped[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ','))
        .collect();
    let body = body.trim_end_matches(['.', ',']);

    let magnitude = canonical_decimal(body).parse::<f64>().unwrap_or(0.0);
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn canonical_decimal(body: &str) -> String {
    match (body.rfind('.'), body.rfind(',')) {
        (Some(dot), Some(comma)) if dot < comma => body.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => body.replace(',', ""),
        (None, Some(comma)) => {
            let (int_part, frac_part) = body.split_at(comma);
            format!("{}.{}", int_part.replace(',', ""), &frac_part[1..])
        }
        (Some(_), None) if is_thousands_grouped(body) => body.replace('.', ""),
        _ => body.to_string(),
    }
}

fn is_thousands_grouped(body: &str) -> bool {
    let mut groups = body.split('.');
    let lead_ok = groups
        .next()
        .is_some_and(|g| (1..=3).contains(&g.len()));
    let mut rest = groups.peekable();
    lead_ok && rest.peek().is_some() && rest.all(|g| g.len() == 3)
}
