use crate::prelude::*;

/// Largest number of holding registers one Modbus read may return.
pub const MAX_READ_WORDS: u16 = 125;

/// Scale factor register value meaning "not implemented".
pub const SCALE_FACTOR_NOT_IMPLEMENTED: u16 = 0x8000;

const SCALE_FACTOR_RANGE: std::ops::RangeInclusive<i16> = -10..=10;

// RegisterBlock {{{
/// A contiguous run of words read from a device. Never modified after the read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterBlock {
    start: u16,
    words: Vec<u16>,
}

impl RegisterBlock {
    pub fn new(start: u16, words: Vec<u16>) -> Self {
        Self { start, words }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// The words `field` covers, or `MalformedBlock` when the block is too short.
    pub fn slice(&self, field: &FieldSpec) -> Result<&[u16], CodecError> {
        let from = usize::from(field.offset);
        let to = from + usize::from(field.count);

        self.words
            .get(from..to)
            .ok_or(CodecError::MalformedBlock {
                field: field.name,
                start: self.start,
                needed: to,
                available: self.words.len(),
            })
    }
} // }}}

// FieldSpec {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeRule {
    /// Unsigned integer, optionally scaled by the named sibling field.
    UnsignedInt(Option<&'static str>),
    /// Two's complement integer, optionally scaled by the named sibling field.
    SignedInt(Option<&'static str>),
    Float32,
    Bitfield16,
    Bitfield32,
    /// Two characters per word, high byte first. Carries the maximum length.
    PackedAscii(usize),
    Enum16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: u16,
    pub count: u16,
    pub rule: DecodeRule,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: u16, count: u16, rule: DecodeRule) -> Self {
        Self {
            name,
            offset,
            count,
            rule,
        }
    }

    pub const fn uint(name: &'static str, offset: u16, count: u16, scale: Option<&'static str>) -> Self {
        Self::new(name, offset, count, DecodeRule::UnsignedInt(scale))
    }

    pub const fn int(name: &'static str, offset: u16, count: u16, scale: Option<&'static str>) -> Self {
        Self::new(name, offset, count, DecodeRule::SignedInt(scale))
    }

    /// A scale factor register, decoded as a plain signed word.
    pub const fn sf(name: &'static str, offset: u16) -> Self {
        Self::new(name, offset, 1, DecodeRule::SignedInt(None))
    }

    pub const fn float(name: &'static str, offset: u16) -> Self {
        Self::new(name, offset, 2, DecodeRule::Float32)
    }

    pub const fn bits16(name: &'static str, offset: u16) -> Self {
        Self::new(name, offset, 1, DecodeRule::Bitfield16)
    }

    pub const fn bits32(name: &'static str, offset: u16) -> Self {
        Self::new(name, offset, 2, DecodeRule::Bitfield32)
    }

    pub const fn enum16(name: &'static str, offset: u16) -> Self {
        Self::new(name, offset, 1, DecodeRule::Enum16)
    }

    pub const fn ascii(name: &'static str, offset: u16, words: u16) -> Self {
        Self::new(name, offset, words, DecodeRule::PackedAscii(words as usize * 2))
    }

    /// Name of the sibling field holding this field's scale factor.
    pub fn scale_ref(&self) -> Option<&'static str> {
        match self.rule {
            DecodeRule::UnsignedInt(scale) | DecodeRule::SignedInt(scale) => scale,
            _ => None,
        }
    }

    /// First word past the field, `None` when it runs past the register space.
    pub fn end(&self) -> Option<u16> {
        self.offset.checked_add(self.count)
    }
} // }}}

// Value {{{
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Scaled(f64),
    Float(f32),
    Bits(u32),
    Text(String),
    Enum(u16),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Unsigned(v) => Some(*v as f64),
            Self::Signed(v) => Some(*v as f64),
            Self::Scaled(v) => Some(*v),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Bits(v) => Some(f64::from(*v)),
            Self::Enum(v) => Some(f64::from(*v)),
            Self::Text(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Unsigned(v) => u32::try_from(*v).ok(),
            Self::Signed(v) => u32::try_from(*v).ok(),
            Self::Bits(v) => Some(*v),
            Self::Enum(v) => Some(u32::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Unsigned(v) => i64::try_from(*v).ok(),
            Self::Signed(v) => Some(*v),
            Self::Bits(v) => Some(i64::from(*v)),
            Self::Enum(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
} // }}}

/// Interprets a scale factor register. The "not implemented" sentinel and
/// anything outside -10..=10 yield exponent 0.
pub fn scale_exponent(word: u16) -> i16 {
    let exponent = word as i16;
    if word == SCALE_FACTOR_NOT_IMPLEMENTED || !SCALE_FACTOR_RANGE.contains(&exponent) {
        debug!("ignoring scale factor {:#06x}", word);
        return 0;
    }
    exponent
}

pub fn apply_exponent(raw: f64, exponent: i16) -> f64 {
    raw * 10f64.powi(i32::from(exponent))
}

/// Decodes `field` from `block`. `exponent` only applies to scaled integer rules.
pub fn decode(block: &RegisterBlock, field: &FieldSpec, exponent: i16) -> Result<Value, CodecError> {
    let words = block.slice(field)?;

    match field.rule {
        DecodeRule::UnsignedInt(scale) => {
            let raw = unsigned(field, words)?;
            Ok(match scale {
                Some(_) => Value::Scaled(apply_exponent(raw as f64, exponent)),
                None => Value::Unsigned(raw),
            })
        }
        DecodeRule::SignedInt(scale) => {
            let raw = signed(field, words)?;
            Ok(match scale {
                Some(_) => Value::Scaled(apply_exponent(raw as f64, exponent)),
                None => Value::Signed(raw),
            })
        }
        DecodeRule::Float32 => {
            let [high, low] = two_words(field, words)?;
            Ok(Value::Float(f32::from_bits(u32::from(high) << 16 | u32::from(low))))
        }
        DecodeRule::Bitfield16 | DecodeRule::Enum16 => {
            let [word] = words else {
                return Err(CodecError::UnsupportedWidth {
                    field: field.name,
                    count: field.count,
                });
            };
            Ok(if field.rule == DecodeRule::Enum16 {
                Value::Enum(*word)
            } else {
                Value::Bits(u32::from(*word))
            })
        }
        DecodeRule::Bitfield32 => {
            let [high, low] = two_words(field, words)?;
            Ok(Value::Bits(u32::from(high) << 16 | u32::from(low)))
        }
        DecodeRule::PackedAscii(max_chars) => Ok(Value::Text(unpack_ascii(words, max_chars))),
    }
}

/// Produces the words to write for `value` into `field`.
pub fn encode(value: &Value, field: &FieldSpec, exponent: i16) -> Result<Vec<u16>, CodecError> {
    let out_of_range = || CodecError::ValueOutOfRange {
        field: field.name,
        value: format!("{:?}", value),
        words: field.count,
    };

    match field.rule {
        DecodeRule::UnsignedInt(_) | DecodeRule::Bitfield16 | DecodeRule::Bitfield32 | DecodeRule::Enum16 => {
            let raw = raw_integer(value, field.scale_ref().is_some(), exponent).ok_or_else(out_of_range)?;
            let bits = 16 * u32::from(field.count);
            if field.count == 0 || field.count > 4 {
                return Err(CodecError::UnsupportedWidth {
                    field: field.name,
                    count: field.count,
                });
            }
            if raw < 0 || raw > (1i128 << bits) - 1 {
                return Err(out_of_range());
            }
            Ok(split_words(raw as u64, field.count))
        }
        DecodeRule::SignedInt(scale) => {
            let raw = raw_integer(value, scale.is_some(), exponent).ok_or_else(out_of_range)?;
            match field.count {
                1 => {
                    let raw = i16::try_from(raw).map_err(|_| out_of_range())?;
                    Ok(vec![raw as u16])
                }
                2 => {
                    let raw = i32::try_from(raw).map_err(|_| out_of_range())?;
                    Ok(split_words(u64::from(raw as u32), 2))
                }
                count => Err(CodecError::UnsupportedWidth {
                    field: field.name,
                    count,
                }),
            }
        }
        DecodeRule::Float32 => {
            let v = value.as_f64().ok_or_else(out_of_range)?;
            if !v.is_finite() || v.abs() > f64::from(f32::MAX) {
                return Err(out_of_range());
            }
            Ok(split_words(u64::from((v as f32).to_bits()), 2))
        }
        DecodeRule::PackedAscii(max_chars) => {
            let text = value.as_text().ok_or_else(out_of_range)?;
            let capacity = max_chars.min(usize::from(field.count) * 2);
            if !text.is_ascii() || text.len() > capacity {
                return Err(out_of_range());
            }
            Ok(pack_ascii(text, field.count))
        }
    }
}

fn unsigned(field: &FieldSpec, words: &[u16]) -> Result<u64, CodecError> {
    if words.is_empty() || words.len() > 4 {
        return Err(CodecError::UnsupportedWidth {
            field: field.name,
            count: field.count,
        });
    }
    Ok(words.iter().fold(0u64, |acc, w| acc << 16 | u64::from(*w)))
}

fn signed(field: &FieldSpec, words: &[u16]) -> Result<i64, CodecError> {
    match words {
        [word] => Ok(i64::from(*word as i16)),
        [high, low] => Ok(i64::from((u32::from(*high) << 16 | u32::from(*low)) as i32)),
        _ => Err(CodecError::UnsupportedWidth {
            field: field.name,
            count: field.count,
        }),
    }
}

fn two_words(field: &FieldSpec, words: &[u16]) -> Result<[u16; 2], CodecError> {
    match words {
        [high, low] => Ok([*high, *low]),
        _ => Err(CodecError::UnsupportedWidth {
            field: field.name,
            count: field.count,
        }),
    }
}

fn raw_integer(value: &Value, scaled: bool, exponent: i16) -> Option<i128> {
    match value {
        Value::Unsigned(v) if !scaled => Some(i128::from(*v)),
        Value::Signed(v) if !scaled => Some(i128::from(*v)),
        Value::Bits(v) => Some(i128::from(*v)),
        Value::Enum(v) => Some(i128::from(*v)),
        Value::Text(_) => None,
        other => {
            let v = other.as_f64()?;
            let raw = if scaled {
                apply_exponent(v, -exponent)
            } else {
                v
            }
            .round();
            raw.is_finite().then_some(raw as i128)
        }
    }
}

fn split_words(raw: u64, count: u16) -> Vec<u16> {
    (0..count)
        .rev()
        .map(|i| (raw >> (16 * u32::from(i))) as u16)
        .collect()
}

pub fn unpack_ascii(words: &[u16], max_chars: usize) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .take(max_chars)
        .take_while(|b| *b != 0)
        .collect();

    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn pack_ascii(text: &str, count: u16) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(usize::from(count) * 2, 0);

    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}
