//! Payload typing: typed values ⇄ little-endian byte encodings.

/// Declared type of a device variable or function return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Bool,
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float,
    Double,
    String,
    Buffer,
}

impl VarType {
    /// Parse an introspection type name. Unknown names fall back to the
    /// caller's default (the session uses `string`).
    pub fn parse(name: &str) -> Option<VarType> {
        Some(match name {
            "bool" => VarType::Bool,
            "int8" => VarType::Int8,
            "int16" => VarType::Int16,
            "int32" | "int" => VarType::Int32,
            "uint8" => VarType::Uint8,
            "uint16" => VarType::Uint16,
            "uint32" => VarType::Uint32,
            "float" => VarType::Float,
            "double" => VarType::Double,
            "string" => VarType::String,
            "buffer" => VarType::Buffer,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("payload of {len} bytes does not decode as {expected:?}")]
pub struct PayloadTypeError {
    pub expected: VarType,
    pub len: usize,
}

/// A typed payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Float(f32),
    Double(f64),
    String(String),
    Buffer(Vec<u8>),
}

impl PayloadValue {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PayloadValue::Bool(v) => vec![u8::from(*v)],
            PayloadValue::Int8(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Int16(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Int32(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Uint8(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Uint16(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Uint32(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Float(v) => v.to_le_bytes().to_vec(),
            PayloadValue::Double(v) => v.to_le_bytes().to_vec(),
            PayloadValue::String(v) => v.as_bytes().to_vec(),
            PayloadValue::Buffer(v) => v.clone(),
        }
    }

    pub fn decode(var_type: VarType, bytes: &[u8]) -> Result<PayloadValue, PayloadTypeError> {
        let wrong = |expected| PayloadTypeError {
            expected,
            len: bytes.len(),
        };
        Ok(match var_type {
            VarType::Bool => {
                let [b] = *bytes else {
                    return Err(wrong(VarType::Bool));
                };
                PayloadValue::Bool(b != 0)
            }
            VarType::Int8 => {
                let arr: [u8; 1] = bytes.try_into().map_err(|_| wrong(VarType::Int8))?;
                PayloadValue::Int8(i8::from_le_bytes(arr))
            }
            VarType::Int16 => {
                let arr: [u8; 2] = bytes.try_into().map_err(|_| wrong(VarType::Int16))?;
                PayloadValue::Int16(i16::from_le_bytes(arr))
            }
            VarType::Int32 => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| wrong(VarType::Int32))?;
                PayloadValue::Int32(i32::from_le_bytes(arr))
            }
            VarType::Uint8 => {
                let arr: [u8; 1] = bytes.try_into().map_err(|_| wrong(VarType::Uint8))?;
                PayloadValue::Uint8(arr[0])
            }
            VarType::Uint16 => {
                let arr: [u8; 2] = bytes.try_into().map_err(|_| wrong(VarType::Uint16))?;
                PayloadValue::Uint16(u16::from_le_bytes(arr))
            }
            VarType::Uint32 => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| wrong(VarType::Uint32))?;
                PayloadValue::Uint32(u32::from_le_bytes(arr))
            }
            VarType::Float => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| wrong(VarType::Float))?;
                PayloadValue::Float(f32::from_le_bytes(arr))
            }
            VarType::Double => {
                let arr: [u8; 8] = bytes.try_into().map_err(|_| wrong(VarType::Double))?;
                PayloadValue::Double(f64::from_le_bytes(arr))
            }
            VarType::String => PayloadValue::String(String::from_utf8_lossy(bytes).into_owned()),
            VarType::Buffer => PayloadValue::Buffer(bytes.to_vec()),
        })
    }
}

impl PayloadValue {
    /// The [`VarType`] this value decodes back under.
    pub fn var_type(&self) -> VarType {
        match self {
            PayloadValue::Bool(_) => VarType::Bool,
            PayloadValue::Int8(_) => VarType::Int8,
            PayloadValue::Int16(_) => VarType::Int16,
            PayloadValue::Int32(_) => VarType::Int32,
            PayloadValue::Uint8(_) => VarType::Uint8,
            PayloadValue::Uint16(_) => VarType::Uint16,
            PayloadValue::Uint32(_) => VarType::Uint32,
            PayloadValue::Float(_) => VarType::Float,
            PayloadValue::Double(_) => VarType::Double,
            PayloadValue::String(_) => VarType::String,
            PayloadValue::Buffer(_) => VarType::Buffer,
        }
    }
}

impl std::fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadValue::Bool(v) => write!(f, "{v}"),
            PayloadValue::Int8(v) => write!(f, "{v}"),
            PayloadValue::Int16(v) => write!(f, "{v}"),
            PayloadValue::Int32(v) => write!(f, "{v}"),
            PayloadValue::Uint8(v) => write!(f, "{v}"),
            PayloadValue::Uint16(v) => write!(f, "{v}"),
            PayloadValue::Uint32(v) => write!(f, "{v}"),
            PayloadValue::Float(v) => write!(f, "{v}"),
            PayloadValue::Double(v) => write!(f, "{v}"),
            PayloadValue::String(v) => write!(f, "{v}"),
            PayloadValue::Buffer(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}
