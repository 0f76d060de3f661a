use crate::codec::{self, FieldSpec, RegisterBlock, Value};
use crate::prelude::*;

/// Register layout of one model block or fixed register map.
#[derive(Debug)]
pub struct ModelDescriptor {
    pub id: u16,
    pub name: &'static str,
    pub length: Option<u16>,
    pub fields: &'static [FieldSpec],
}

impl ModelDescriptor {
    pub fn field(&self, name: &str) -> Result<&'static FieldSpec, CodecError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| CodecError::UnknownField(name.to_string()))
    }

    /// Words the block occupies; the declared length wins over the field extent.
    pub fn word_length(&self) -> u16 {
        self.length.unwrap_or_else(|| {
            self.fields
                .iter()
                .map(|f| f.end().unwrap_or(u16::MAX))
                .max()
                .unwrap_or(0)
        })
    }

    /// Resolves the exponent `field` is scaled by, 0 when it has none.
    pub fn exponent(&self, block: &RegisterBlock, field: &FieldSpec) -> Result<i16, CodecError> {
        let Some(scale) = field.scale_ref() else {
            return Ok(0);
        };

        let words = block.slice(self.field(scale)?)?;
        Ok(words.first().map(|w| codec::scale_exponent(*w)).unwrap_or(0))
    }

    pub fn decode(&self, block: &RegisterBlock, name: &str) -> Result<Value, CodecError> {
        let field = self.field(name)?;
        let exponent = self.exponent(block, field)?;
        codec::decode(block, field, exponent)
    }

    /// Decodes `name` as a number, for the common case of a facade filling a state.
    pub fn number(&self, block: &RegisterBlock, name: &str) -> Result<f64, CodecError> {
        let value = self.decode(block, name)?;
        value.as_f64().ok_or(CodecError::UnknownField(name.to_string()))
    }

    pub fn text(&self, block: &RegisterBlock, name: &str) -> Result<String, CodecError> {
        match self.decode(block, name)? {
            Value::Text(text) => Ok(text.trim_end().to_string()),
            _ => Err(CodecError::UnknownField(name.to_string())),
        }
    }

    pub fn encode(&self, name: &str, value: &Value, exponent: i16) -> Result<Vec<u16>, CodecError> {
        codec::encode(value, self.field(name)?, exponent)
    }

    /// Checks that fields are disjoint, inside the block and that every
    /// scale reference names a sibling field.
    pub fn check_layout(&self) -> Result<(), String> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            let end = field
                .end()
                .ok_or_else(|| format!("{}: {} runs past register {}", self.name, field.name, u16::MAX))?;
            fields.push((field, end));
        }
        fields.sort_by_key(|(f, _)| f.offset);

        for pair in fields.windows(2) {
            let ((first, end), (second, _)) = (pair[0], pair[1]);
            if end > second.offset {
                return Err(format!("{}: {} overlaps {}", self.name, first.name, second.name));
            }
        }

        if let Some((last, end)) = fields.last() {
            if *end > self.word_length() {
                return Err(format!("{}: {} ends past the block", self.name, last.name));
            }
        }

        for field in self.fields {
            if let Some(scale) = field.scale_ref() {
                if self.field(scale).is_err() {
                    return Err(format!("{}: {} scales by missing {}", self.name, field.name, scale));
                }
            }
        }

        Ok(())
    }
}

/// A descriptor pinned at a fixed address, for devices that do not describe themselves.
#[derive(Debug)]
pub struct FixedMap {
    pub start: u16,
    pub descriptor: ModelDescriptor,
}

impl FixedMap {
    pub fn len(&self) -> u16 {
        self.descriptor.word_length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute register address of `name`.
    pub fn address(&self, name: &str) -> Result<u16, CodecError> {
        Ok(self.start + self.descriptor.field(name)?.offset)
    }
}

// Fields {{{
/// Decodes fields of one block, logging and dropping the ones that fail.
pub struct Fields<'a> {
    thing_id: &'a ThingId,
    descriptor: &'static ModelDescriptor,
    block: &'a RegisterBlock,
}

impl<'a> Fields<'a> {
    pub fn new(thing_id: &'a ThingId, descriptor: &'static ModelDescriptor, block: &'a RegisterBlock) -> Self {
        Self {
            thing_id,
            descriptor,
            block,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.descriptor.number(self.block, name) {
            Ok(v) if v.is_finite() => Some(v),
            Ok(v) => {
                debug!("{}: {} is {}, keeping previous value", self.thing_id, name, v);
                None
            }
            Err(e) => {
                warn!("{}: {}", self.thing_id, e);
                None
            }
        }
    }

    pub fn code(&self, name: &str) -> Option<u32> {
        match self.descriptor.decode(self.block, name) {
            Ok(v) => v.as_u32(),
            Err(e) => {
                warn!("{}: {}", self.thing_id, e);
                None
            }
        }
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.descriptor
            .text(self.block, name)
            .map_err(|e| warn!("{}: {}", self.thing_id, e))
            .ok()
    }
} // }}}
