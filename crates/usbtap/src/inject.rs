//! Declarative traffic injection: match-and-mutate rules compiled from a JSON
//! file and applied in-flight.
//!
//! The engine is pure. It never touches a transport, so pipelines and the EP0
//! loop call it freely from any thread.
//!
//! Numeric fields in the rule file are base-10; a JSON string value may carry
//! a `0x` prefix for hex. Anything else is rejected when the rule set is
//! compiled, never at match time.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::RuleError;
use crate::usb::{SetupPacket, MAX_TRANSFER};

// ---------------------------------------------------------------------------
// Wire model (serde view of the JSON file).

/// A numeric rule-file field: a JSON integer, or a string that is decimal or
/// `0x`-prefixed hex.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumField {
    Int(u64),
    Str(String),
}

impl NumField {
    fn parse(&self, field: &'static str) -> Result<u64, RuleError> {
        match self {
            NumField::Int(v) => Ok(*v),
            NumField::Str(s) => {
                let t = s.trim();
                let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"))
                {
                    u64::from_str_radix(hex, 16)
                } else {
                    t.parse::<u64>()
                };
                parsed.map_err(|_| RuleError::NumberSyntax {
                    field,
                    value: s.clone(),
                })
            }
        }
    }

    fn parse_u16(&self, field: &'static str) -> Result<u16, RuleError> {
        let v = self.parse(field)?;
        u16::try_from(v).map_err(|_| RuleError::NumberRange {
            field,
            value: v,
            max: u16::MAX as u64,
        })
    }

    fn parse_u8(&self, field: &'static str) -> Result<u8, RuleError> {
        let v = self.parse(field)?;
        u8::try_from(v).map_err(|_| RuleError::NumberRange {
            field,
            value: v,
            max: u8::MAX as u64,
        })
    }
}

fn default_enable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ActionSpec {
    Modify,
    Ignore,
    Stall,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlRuleSpec {
    #[serde(default, rename = "bmRequestType")]
    bm_request_type: Option<NumField>,
    #[serde(default, rename = "bRequest")]
    b_request: Option<NumField>,
    #[serde(default, rename = "wValue")]
    w_value: Option<NumField>,
    #[serde(default, rename = "wIndex")]
    w_index: Option<NumField>,
    #[serde(default, rename = "wLength")]
    w_length: Option<NumField>,
    #[serde(default = "default_enable")]
    enable: bool,
    #[serde(default)]
    action: Option<ActionSpec>,
    #[serde(default)]
    content_pattern: Vec<String>,
    #[serde(default)]
    replacement: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataRuleSpec {
    ep_address: NumField,
    #[serde(default = "default_enable")]
    enable: bool,
    #[serde(default)]
    content_pattern: Vec<String>,
    #[serde(default)]
    replacement: Option<String>,
}

/// Top-level shape of the rule file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFileSpec {
    #[serde(default)]
    control: Vec<ControlRuleSpec>,
    #[serde(default)]
    bulk: Vec<DataRuleSpec>,
    #[serde(default, rename = "int")]
    interrupt: Vec<DataRuleSpec>,
}

impl RuleFileSpec {
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        Ok(serde_json::from_str(json)?)
    }
}

// ---------------------------------------------------------------------------
// Compiled model.

/// Bytewise find/replace: every `patterns` occurrence becomes `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRule {
    patterns: Vec<Vec<u8>>,
    replacement: Vec<u8>,
}

impl ModifyRule {
    /// Apply every pattern, left to right, on non-overlapping matches. If the
    /// result would exceed [`MAX_TRANSFER`], the whole rule is skipped and
    /// the payload forwarded unchanged.
    fn apply(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let mut out = payload.to_vec();
        let mut touched = false;
        for pattern in &self.patterns {
            if let Some(next) = find_replace(&out, pattern, &self.replacement) {
                out = next;
                touched = true;
            }
        }
        if !touched {
            return None;
        }
        if out.len() > MAX_TRANSFER {
            tracing::warn!(
                len = out.len(),
                max = MAX_TRANSFER,
                "injection would oversize payload; rule skipped"
            );
            return None;
        }
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    Modify(ModifyRule),
    Ignore,
    Stall,
}

#[derive(Debug, Clone)]
pub struct ControlRule {
    bm_request_type: Option<u8>,
    b_request: Option<u8>,
    w_value: Option<u16>,
    w_index: Option<u16>,
    w_length: Option<u16>,
    pub action: ControlAction,
}

impl ControlRule {
    /// Field-by-field match; an absent field is a wildcard.
    fn matches(&self, setup: &SetupPacket) -> bool {
        fn field<T: PartialEq>(want: Option<T>, got: T) -> bool {
            want.map_or(true, |w| w == got)
        }
        field(self.bm_request_type, setup.request_type)
            && field(self.b_request, setup.request)
            && field(self.w_value, setup.value)
            && field(self.w_index, setup.index)
            && field(self.w_length, setup.length)
    }
}

/// What the EP0 state machine should do with a matched control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlVerdict {
    /// Forward, with the (possibly rewritten) payload.
    Forward(Vec<u8>),
    /// Swallow: empty reply for IN, acknowledged-but-unsent for OUT.
    Drop,
    /// Stall EP0.
    Stall,
}

/// Compiled, immutable rule set.
#[derive(Debug, Default)]
pub struct RuleSet {
    control: Vec<ControlRule>,
    bulk: HashMap<u8, Vec<ModifyRule>>,
    interrupt: HashMap<u8, Vec<ModifyRule>>,
}

impl RuleSet {
    /// Empty rule set: everything forwards untouched.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn compile(spec: RuleFileSpec) -> Result<Self, RuleError> {
        let mut control = Vec::new();
        for (index, rule) in spec.control.iter().enumerate() {
            if !rule.enable {
                continue;
            }
            let action = match rule.action.unwrap_or(ActionSpec::Modify) {
                ActionSpec::Ignore => ControlAction::Ignore,
                ActionSpec::Stall => ControlAction::Stall,
                ActionSpec::Modify => ControlAction::Modify(compile_modify(
                    index,
                    &rule.content_pattern,
                    rule.replacement.as_deref(),
                )?),
            };
            control.push(ControlRule {
                bm_request_type: rule
                    .bm_request_type
                    .as_ref()
                    .map(|f| f.parse_u8("bmRequestType"))
                    .transpose()?,
                b_request: rule
                    .b_request
                    .as_ref()
                    .map(|f| f.parse_u8("bRequest"))
                    .transpose()?,
                w_value: rule
                    .w_value
                    .as_ref()
                    .map(|f| f.parse_u16("wValue"))
                    .transpose()?,
                w_index: rule
                    .w_index
                    .as_ref()
                    .map(|f| f.parse_u16("wIndex"))
                    .transpose()?,
                w_length: rule
                    .w_length
                    .as_ref()
                    .map(|f| f.parse_u16("wLength"))
                    .transpose()?,
                action,
            });
        }

        Ok(Self {
            control,
            bulk: compile_data_rules(&spec.bulk)?,
            interrupt: compile_data_rules(&spec.interrupt)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.bulk.is_empty() && self.interrupt.is_empty()
    }

    /// First control rule matching `setup`, in declaration order.
    pub fn match_control(&self, setup: &SetupPacket) -> Option<&ControlRule> {
        self.control.iter().find(|r| r.matches(setup))
    }

    /// Full control decision for a payload-bearing stage.
    pub fn apply_control(&self, setup: &SetupPacket, payload: &[u8]) -> ControlVerdict {
        match self.match_control(setup).map(|r| &r.action) {
            None => ControlVerdict::Forward(payload.to_vec()),
            Some(ControlAction::Ignore) => ControlVerdict::Drop,
            Some(ControlAction::Stall) => ControlVerdict::Stall,
            Some(ControlAction::Modify(rule)) => {
                ControlVerdict::Forward(rule.apply(payload).unwrap_or_else(|| payload.to_vec()))
            }
        }
    }

    /// Rewrite a data-endpoint payload. `None` means untouched.
    pub fn apply_data(&self, ep_address: u8, payload: &[u8]) -> Option<Vec<u8>> {
        let mut current: Option<Vec<u8>> = None;
        for table in [&self.bulk, &self.interrupt] {
            let Some(rules) = table.get(&ep_address) else {
                continue;
            };
            for rule in rules {
                let input = current.as_deref().unwrap_or(payload);
                if let Some(next) = rule.apply(input) {
                    current = Some(next);
                }
            }
        }
        current
    }
}

fn compile_data_rules(specs: &[DataRuleSpec]) -> Result<HashMap<u8, Vec<ModifyRule>>, RuleError> {
    let mut out: HashMap<u8, Vec<ModifyRule>> = HashMap::new();
    for (index, rule) in specs.iter().enumerate() {
        if !rule.enable {
            continue;
        }
        let ep = rule.ep_address.parse_u8("ep_address")?;
        let compiled = compile_modify(index, &rule.content_pattern, rule.replacement.as_deref())?;
        out.entry(ep).or_default().push(compiled);
    }
    Ok(out)
}

fn compile_modify(
    index: usize,
    patterns: &[String],
    replacement: Option<&str>,
) -> Result<ModifyRule, RuleError> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let bytes = unescape(pattern, "content_pattern")?;
        if bytes.is_empty() {
            return Err(RuleError::EmptyPattern { index });
        }
        if bytes.len() > MAX_TRANSFER {
            return Err(RuleError::OversizedPattern { index });
        }
        compiled.push(bytes);
    }
    if compiled.is_empty() {
        return Err(RuleError::EmptyPattern { index });
    }
    let replacement = unescape(replacement.unwrap_or(""), "replacement")?;
    if replacement.len() > MAX_TRANSFER {
        return Err(RuleError::OversizedPattern { index });
    }
    Ok(ModifyRule {
        patterns: compiled,
        replacement,
    })
}

/// Decode a pattern string into bytes: `\xHH` escapes become single bytes,
/// `\\` a literal backslash, everything else its UTF-8 bytes.
fn unescape(s: &str, field: &'static str) -> Result<Vec<u8>, RuleError> {
    let bad = |reason| RuleError::BadEscape { field, reason };
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(b'x') | Some(b'X') => {
                let hi = bytes.get(i + 2).copied().ok_or(bad("truncated \\x escape"))?;
                let lo = bytes.get(i + 3).copied().ok_or(bad("truncated \\x escape"))?;
                let hex = |b: u8| (b as char).to_digit(16);
                let (hi, lo) = match (hex(hi), hex(lo)) {
                    (Some(h), Some(l)) => (h, l),
                    _ => return Err(bad("non-hex digit in \\x escape")),
                };
                out.push((hi * 16 + lo) as u8);
                i += 4;
            }
            Some(_) => return Err(bad("unknown escape (only \\xHH and \\\\ allowed)")),
            None => return Err(bad("trailing backslash")),
        }
    }
    Ok(out)
}

/// Replace non-overlapping occurrences of `needle` with `rep`, left to right.
/// `None` when the haystack does not contain the needle.
fn find_replace(hay: &[u8], needle: &[u8], rep: &[u8]) -> Option<Vec<u8>> {
    debug_assert!(!needle.is_empty());
    let mut out = Vec::with_capacity(hay.len());
    let mut i = 0;
    let mut replaced = false;
    while i < hay.len() {
        if hay.len() - i >= needle.len() && &hay[i..i + needle.len()] == needle {
            out.extend_from_slice(rep);
            i += needle.len();
            replaced = true;
        } else {
            out.push(hay[i]);
            i += 1;
        }
    }
    replaced.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(json: &str) -> RuleSet {
        RuleSet::compile(RuleFileSpec::from_json(json).unwrap()).unwrap()
    }

    fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    #[test]
    fn find_replace_non_overlapping_left_to_right() {
        assert_eq!(
            find_replace(b"aaaa", b"aa", b"b"),
            Some(b"bb".to_vec())
        );
        assert_eq!(
            find_replace(b"xabcabcx", b"abc", b"Y"),
            Some(b"xYYx".to_vec())
        );
        assert_eq!(find_replace(b"hello", b"zz", b"y"), None);
    }

    #[test]
    fn unescape_hex_and_literals() {
        assert_eq!(unescape(r"\x01\x00", "p").unwrap(), vec![1, 0]);
        assert_eq!(unescape(r"ab\\c", "p").unwrap(), b"ab\\c".to_vec());
        assert_eq!(unescape(r"\xFF", "p").unwrap(), vec![0xff]);
        assert!(unescape(r"\x0", "p").is_err());
        assert!(unescape(r"\xzz", "p").is_err());
        assert!(unescape(r"\q", "p").is_err());
        assert!(unescape("trailing\\", "p").is_err());
    }

    #[test]
    fn numeric_fields_decimal_unless_0x_prefixed() {
        let rules = compile(
            r#"{"int": [
                {"ep_address": 129, "content_pattern": ["\\x01"], "replacement": "\\x02"},
                {"ep_address": "0x02", "content_pattern": ["\\x03"], "replacement": "\\x04"}
            ]}"#,
        );
        assert_eq!(rules.apply_data(0x81, &[1]), Some(vec![2]));
        assert_eq!(rules.apply_data(0x02, &[3]), Some(vec![4]));
        // "81" is decimal 81, not 0x81.
        let rules = compile(
            r#"{"int": [{"ep_address": "81", "content_pattern": ["\\x01"], "replacement": "\\x02"}]}"#,
        );
        assert_eq!(rules.apply_data(0x81, &[1]), None);
        assert_eq!(rules.apply_data(81, &[1]), Some(vec![2]));
    }

    #[test]
    fn bad_numbers_rejected_at_compile_time() {
        let spec = RuleFileSpec::from_json(
            r#"{"int": [{"ep_address": "8g", "content_pattern": ["\\x01"], "replacement": ""}]}"#,
        )
        .unwrap();
        assert!(matches!(
            RuleSet::compile(spec),
            Err(RuleError::NumberSyntax { field: "ep_address", .. })
        ));

        let spec = RuleFileSpec::from_json(
            r#"{"int": [{"ep_address": 300, "content_pattern": ["\\x01"], "replacement": ""}]}"#,
        )
        .unwrap();
        assert!(matches!(
            RuleSet::compile(spec),
            Err(RuleError::NumberRange { field: "ep_address", value: 300, .. })
        ));
    }

    #[test]
    fn empty_pattern_rejected() {
        let spec = RuleFileSpec::from_json(
            r#"{"bulk": [{"ep_address": 2, "content_pattern": [], "replacement": "x"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            RuleSet::compile(spec),
            Err(RuleError::EmptyPattern { index: 0 })
        ));
    }

    #[test]
    fn disabled_rules_are_not_compiled() {
        let rules = compile(
            r#"{"control": [{"bRequest": 6, "enable": false, "action": "stall"}]}"#,
        );
        assert!(rules.is_empty());
        assert!(rules.match_control(&setup(0x80, 6, 0x0100, 0, 18)).is_none());
    }

    #[test]
    fn control_first_match_wins_with_wildcards() {
        let rules = compile(
            r#"{"control": [
                {"bRequest": 6, "wValue": 256, "action": "ignore"},
                {"bRequest": 6, "action": "stall"}
            ]}"#,
        );
        let device_desc = setup(0x80, 6, 0x0100, 0, 18);
        assert_eq!(
            rules.apply_control(&device_desc, &[]),
            ControlVerdict::Drop
        );
        let string_desc = setup(0x80, 6, 0x0300, 0, 255);
        assert_eq!(
            rules.apply_control(&string_desc, &[]),
            ControlVerdict::Stall
        );
        let unrelated = setup(0x21, 9, 0x0200, 0, 8);
        assert_eq!(
            rules.apply_control(&unrelated, b"hi"),
            ControlVerdict::Forward(b"hi".to_vec())
        );
    }

    #[test]
    fn control_modify_rewrites_payload() {
        let rules = compile(
            r#"{"control": [{
                "bmRequestType": 128,
                "bRequest": 6,
                "content_pattern": ["\\x01\\x02"],
                "replacement": "\\xaa\\xbb"
            }]}"#,
        );
        let s = setup(0x80, 6, 0x0100, 0, 18);
        assert_eq!(
            rules.apply_control(&s, &[0x00, 0x01, 0x02, 0x03]),
            ControlVerdict::Forward(vec![0x00, 0xaa, 0xbb, 0x03])
        );
    }

    #[test]
    fn mouse_button_swap_rule() {
        // The canonical interrupt rewrite: button 1 reported as button 2.
        let rules = compile(
            r#"{"int": [{
                "ep_address": 129,
                "enable": true,
                "content_pattern": ["\\x01\\x00\\x00\\x00"],
                "replacement": "\\x02\\x00\\x00\\x00"
            }]}"#,
        );
        assert_eq!(
            rules.apply_data(0x81, &[0x01, 0x00, 0x00, 0x00]),
            Some(vec![0x02, 0x00, 0x00, 0x00])
        );
        assert_eq!(rules.apply_data(0x81, &[0x02, 0x00, 0x00, 0x00]), None);
        assert_eq!(rules.apply_data(0x82, &[0x01, 0x00, 0x00, 0x00]), None);
    }

    #[test]
    fn growth_beyond_max_transfer_skips_rule() {
        let rules = compile(
            r#"{"bulk": [{
                "ep_address": 2,
                "content_pattern": ["\\x00"],
                "replacement": "\\x01\\x01\\x01\\x01"
            }]}"#,
        );
        // 2048 zero bytes would become 8192 bytes; the rule must be skipped.
        let payload = vec![0u8; 2048];
        assert_eq!(rules.apply_data(0x02, &payload), None);
        // A small payload still gets rewritten.
        assert_eq!(
            rules.apply_data(0x02, &[0x00]),
            Some(vec![1, 1, 1, 1])
        );
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(RuleFileSpec::from_json(
            r#"{"control": [{"bReqest": 6, "action": "stall"}]}"#
        )
        .is_err());
    }
}
