use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `(brokerage, normalized structure)`.
pub type PatternHash = String;

/// Action verbs kept verbatim during normalization. Matching is
/// case-insensitive but the original token is preserved.
const ACTION_KEYWORDS: &[&str] = &[
    "BUY", "BOUGHT", "SELL", "SOLD", "PURCHASE", "PURCHASED", "REINVEST", "REINVESTMENT",
    "DIVIDEND", "DIV", "INTEREST", "INT", "FEE", "FEES", "TRANSFER", "DEPOSIT", "WITHDRAWAL",
    "ASSIGNED", "ASSIGNMENT", "EXERCISED", "EXERCISE", "EXPIRED", "EXPIRATION", "OPEN",
    "CLOSE", "CLOSING", "OPENING", "REDEMPTION", "REDEEMED", "MATURED", "MATURITY",
];

const INSTRUMENT_KEYWORDS: &[&str] = &[
    "CALL", "CALLS", "PUT", "PUTS", "OPTION", "OPTIONS", "SHARE", "SHARES", "STOCK", "ETF",
    "FUND", "BOND", "NOTE", "NOTES", "CD", "TREASURY", "BILL", "CASH", "MONEY", "MARKET",
    "STRUCTURED", "WARRANT", "RIGHTS", "UNIT", "UNITS", "CONTRACT", "CONTRACTS",
];

lazy_static! {
    // Pass 1: date-like substrings. Order matters inside the pass too: month-name
    // dates first so "MAY 16 2026" never leaves a stray small number behind.
    static ref MONTH_DATE_RE: Regex = Regex::new(
        r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(,)?\s+\d{2,4}\b"
    ).unwrap();
    static ref SLASH_DATE_RE: Regex = Regex::new(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b").unwrap();
    static ref ISO_DATE_RE: Regex = Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap();
    // Compact 6-digit date (e.g. 051626) — must run before the account pass.
    static ref COMPACT_DATE_RE: Regex = Regex::new(r"\b\d{6}\b").unwrap();

    // Pass 2: currency / amount-like substrings.
    static ref CURRENCY_RE: Regex = Regex::new(r"\$\s?\d[\d,]*(\.\d+)?").unwrap();
    static ref COMMA_NUM_RE: Regex = Regex::new(r"\b\d{1,3}(,\d{3})+(\.\d+)?\b").unwrap();
    static ref AT_PRICE_RE: Regex = Regex::new(r"@\s?\d+(\.\d+)?").unwrap();

    // Pass 3: long digit runs (account / CUSIP-like).
    static ref ACCT_RE: Regex = Regex::new(r"\b\d{4,}\b").unwrap();

    static ref UPPER_TOKEN_RE: Regex = Regex::new(r"^[A-Z]{1,5}$").unwrap();
    static ref NUMBER_TOKEN_RE: Regex = Regex::new(r"^\d+(\.\d+)?$").unwrap();
}

fn is_keyword(token: &str) -> bool {
    let upper = token.to_uppercase();
    ACTION_KEYWORDS.contains(&upper.as_str()) || INSTRUMENT_KEYWORDS.contains(&upper.as_str())
}

/// Collapse a raw transaction description into its structural template.
///
/// Variable fields (dates, amounts, account numbers, tickers, strikes) are
/// masked; action verbs, instrument keywords and short connector words are
/// kept so the sentence shape survives. Two rows that differ only in ticker,
/// date or dollar amount normalize identically.
pub fn normalize(raw_text: &str) -> String {
    // Substring passes. Earlier passes protect later ones from mis-tokenizing
    // already-masked fields (a slash date would otherwise look like strikes).
    let mut text = MONTH_DATE_RE.replace_all(raw_text, "DATE").into_owned();
    text = SLASH_DATE_RE.replace_all(&text, "DATE").into_owned();
    text = ISO_DATE_RE.replace_all(&text, "DATE").into_owned();
    text = CURRENCY_RE.replace_all(&text, "AMT").into_owned();
    text = COMMA_NUM_RE.replace_all(&text, "AMT").into_owned();
    text = AT_PRICE_RE.replace_all(&text, "@AMT").into_owned();
    text = COMPACT_DATE_RE.replace_all(&text, "DATE").into_owned();
    text = ACCT_RE.replace_all(&text, "ACCT").into_owned();

    // Token pass.
    let mut out: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let core = token.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '(' | ')' | '"'));
        if core.is_empty() {
            continue;
        }
        if core.contains("DATE") || core.contains("AMT") || core.contains("ACCT") {
            out.push(core.to_string());
        } else if is_keyword(core) {
            out.push(core.to_string());
        } else if UPPER_TOKEN_RE.is_match(core) {
            out.push("TICKER".to_string());
        } else if NUMBER_TOKEN_RE.is_match(core) {
            out.push("STRIKE".to_string());
        } else if core.len() > 3 {
            out.push("TERM".to_string());
        } else {
            // Short connectors ("of", "to", "at") keep the sentence shape.
            out.push(core.to_string());
        }
    }

    out.join(" ")
}

/// Content address for the pattern memory: deterministic across restarts,
/// collision-resistant across brokerages and structural templates.
pub fn compute_hash(raw_text: &str, brokerage: &str) -> PatternHash {
    let normalized = normalize(raw_text);
    let mut hasher = Sha256::new();
    hasher.update(brokerage.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
