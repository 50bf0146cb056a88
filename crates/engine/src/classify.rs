use serde_json::Value;
use shared::domain::ValueType;

const EASING_KEYWORDS: &[&str] = &[
    "linear",
    "ease",
    "ease-in",
    "ease-out",
    "ease-in-out",
    "step-start",
    "step-end",
];

/// Classifies a tunable value so UI layers can pick a widget for it.
///
/// Pure and total: always returns a tag, never fails. The checks run in a
/// fixed priority order: explicit boolean, then numeric, then string
/// heuristics driven by the key name and the value's textual shape. The
/// result is informational only and never feeds back into ordering or
/// consistency decisions.
pub fn classify_value(key: &str, value: &Value) -> ValueType {
    match value {
        Value::Bool(_) => ValueType::Boolean,
        Value::Number(_) => ValueType::Number,
        Value::String(text) => classify_text(key, text),
        _ => ValueType::Text,
    }
}

fn classify_text(key: &str, text: &str) -> ValueType {
    let key = key.to_ascii_lowercase();
    let text = text.trim();
    let lowered = text.to_ascii_lowercase();

    if key.contains("shadow") {
        return ValueType::BoxShadow;
    }
    if key.contains("gradient") || lowered.contains("gradient(") {
        return ValueType::Gradient;
    }
    if is_easing_key(&key) && is_easing_value(&lowered) {
        return ValueType::EasingCurve;
    }
    if looks_like_shadow(text) {
        return ValueType::BoxShadow;
    }
    if lowered.starts_with('#')
        || lowered.starts_with("rgb(")
        || lowered.starts_with("rgba(")
        || lowered.starts_with("hsl(")
        || lowered.starts_with("hsla(")
    {
        return ValueType::Color;
    }
    ValueType::Text
}

fn is_easing_key(key: &str) -> bool {
    key.contains("easing") || key.contains("timing") || key.contains("curve") || key.contains("ease")
}

fn is_easing_value(lowered: &str) -> bool {
    lowered.starts_with("cubic-bezier(")
        || lowered.starts_with("steps(")
        || EASING_KEYWORDS.contains(&lowered)
}

/// A shadow shorthand leads with at least three length tokens, e.g.
/// `0px 4px 12px rgba(0,0,0,0.25)`.
fn looks_like_shadow(text: &str) -> bool {
    let mut lengths = 0;
    for token in text.split_whitespace().take(3) {
        if is_css_length(token) {
            lengths += 1;
        } else {
            break;
        }
    }
    lengths >= 3
}

fn is_css_length(token: &str) -> bool {
    let numeric = token
        .trim_end_matches("px")
        .trim_end_matches("em")
        .trim_end_matches("rem")
        .trim_end_matches('%');
    !numeric.is_empty() && numeric.parse::<f64>().is_ok()
}
