//! Decodificação de valores de probes.
//!
//! O núcleo não conhece os formatos numéricos: ele entrega ao
//! [`ValueCodec`] o tag de armazenamento da probe e a posição atual no
//! payload, e recebe de volta o valor e a nova posição.

use std::fmt;

use crate::protocol::{ProtocolError, WireReader};
use crate::types::StorageType;

/// Valor de uma amostra.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeValue {
    Int(i32),
    Float(f32),
    Double(f64),
}

impl ProbeValue {
    /// Escreve o valor em big-endian, como o coletor envia.
    pub fn write_be(self, out: &mut Vec<u8>) {
        match self {
            ProbeValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            ProbeValue::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            ProbeValue::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
        }
    }
}

impl fmt::Display for ProbeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeValue::Int(v) => write!(f, "{v}"),
            ProbeValue::Float(v) => write!(f, "{v}"),
            ProbeValue::Double(v) => write!(f, "{v}"),
        }
    }
}

/// Decodificador plugável de valores.
///
/// Deve consumir exatamente os bytes do valor e retornar a posição logo
/// após ele.
pub trait ValueCodec {
    fn decode(&self, storage: StorageType, data: &[u8], pos: usize) -> Result<(ProbeValue, usize), ProtocolError>;
}

/// Codec padrão do coletor: `0` = i32, `1` = f32, `2` = f64, todos big-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl StandardCodec {
    pub const INT: u8 = 0;
    pub const FLOAT: u8 = 1;
    pub const DOUBLE: u8 = 2;
}

impl ValueCodec for StandardCodec {
    fn decode(&self, storage: StorageType, data: &[u8], pos: usize) -> Result<(ProbeValue, usize), ProtocolError> {
        let mut r = WireReader::at(data, pos);
        let value = match storage.tag() {
            Self::INT => ProbeValue::Int(i32::from_be_bytes(r.array("value")?)),
            Self::FLOAT => ProbeValue::Float(f32::from_be_bytes(r.array("value")?)),
            Self::DOUBLE => ProbeValue::Double(f64::from_be_bytes(r.array("value")?)),
            other => return Err(ProtocolError::UnknownStorageType(other)),
        };
        Ok((value, r.position()))
    }
}
