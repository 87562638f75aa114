use alloy_dyn_abi::DynSolValue;
use alloy_primitives::hex;
use serde_json::Value;

/// Render a decoded ABI value as canonical text.
///
/// Booleans are lowercase literals, integers base-10, byte strings and addresses
/// lowercase `0x` hex, strings verbatim. Arrays and tuples become compact JSON
/// arrays whose leaves follow the same rules.
pub fn canonical_text(value: &DynSolValue) -> String {
    match value {
        DynSolValue::Bool(b) => b.to_string(),
        DynSolValue::Int(i, _) => i.to_string(),
        DynSolValue::Uint(u, _) => u.to_string(),
        DynSolValue::Address(a) => hex::encode_prefixed(a.as_slice()),
        DynSolValue::FixedBytes(word, size) => hex::encode_prefixed(&word[..(*size).min(32)]),
        DynSolValue::Bytes(b) => hex::encode_prefixed(b),
        DynSolValue::String(s) => s.clone(),
        DynSolValue::Function(f) => hex::encode_prefixed(f.as_slice()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect()).to_string()
        }
        #[allow(unreachable_patterns)]
        other => Value::Array(
            other
                .as_fixed_seq()
                .unwrap_or_default()
                .iter()
                .map(to_json)
                .collect(),
        )
        .to_string(),
    }
}

fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        scalar => Value::String(canonical_text(scalar)),
    }
}

/// Exact decimal rendering of an integer amount scaled by `decimals`.
/// `("1500000", 6)` -> `"1.5"`. Returns `None` for non-numeric input.
pub fn format_units(raw: &str, decimals: u8) -> Option<String> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let digits = digits.trim_start_matches('0');
    let decimals = decimals as usize;
    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');

    let mut out = String::with_capacity(padded.len() + 2);
    if negative && !(whole == "0" && fraction.is_empty()) {
        out.push('-');
    }
    out.push_str(whole);
    if !fraction.is_empty() {
        out.push('.');
        out.push_str(fraction);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, I256, U256};

    #[test]
    fn scalars_render_canonically() {
        assert_eq!(canonical_text(&DynSolValue::Bool(true)), "true");
        assert_eq!(
            canonical_text(&DynSolValue::Uint(U256::from(1_000_000u64), 256)),
            "1000000"
        );
        assert_eq!(
            canonical_text(&DynSolValue::Int(I256::from_dec_str("-42").unwrap(), 24)),
            "-42"
        );
        let addr: Address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap();
        assert_eq!(
            canonical_text(&DynSolValue::Address(addr)),
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
        assert_eq!(
            canonical_text(&DynSolValue::FixedBytes(B256::repeat_byte(0xAB), 4)),
            "0xabababab"
        );
        assert_eq!(
            canonical_text(&DynSolValue::Bytes(vec![0xDE, 0xAD])),
            "0xdead"
        );
        assert_eq!(
            canonical_text(&DynSolValue::String("Hello".to_string())),
            "Hello"
        );
    }

    #[test]
    fn arrays_and_tuples_nest_as_json() {
        let value = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(7u64), 8),
            DynSolValue::Array(vec![DynSolValue::Bool(false), DynSolValue::Bool(true)]),
        ]);
        assert_eq!(canonical_text(&value), r#"["7",["false","true"]]"#);
        assert_eq!(canonical_text(&DynSolValue::Array(vec![])), "[]");
    }

    #[test]
    fn formats_token_units_exactly() {
        assert_eq!(format_units("1500000", 6).as_deref(), Some("1.5"));
        assert_eq!(format_units("1", 18).as_deref(), Some("0.000000000000000001"));
        assert_eq!(format_units("1000000000000000000", 18).as_deref(), Some("1"));
        assert_eq!(format_units("0", 6).as_deref(), Some("0"));
        assert_eq!(format_units("42", 0).as_deref(), Some("42"));
        assert_eq!(format_units("-250", 2).as_deref(), Some("-2.5"));
        assert_eq!(format_units("0x10", 2), None);
        assert_eq!(format_units("", 2), None);
    }
}
