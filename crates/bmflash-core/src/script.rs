//! Init-script interpreter.
//!
//! Device init sequences arrive as `(operator, left, right)` rows from a
//! [`ScriptSource`]. Each row resolves `right` to a value, optionally
//! combines it with the current value at `left`, and stores the result
//! either in target memory or in the `$` result slot.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::SessionError;

/// How a row combines its value with the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Assign,
    Or,
    And,
    AndNot,
}

/// Access width of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Width {
    Byte,
    Half,
    #[default]
    Word,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Half => 0xFFFF,
            Width::Word => u32::MAX,
        }
    }

    fn decode(self, bytes: &[u8]) -> u32 {
        match self {
            Width::Byte => bytes.first().copied().unwrap_or(0) as u32,
            Width::Half => LittleEndian::read_u16(bytes) as u32,
            Width::Word => LittleEndian::read_u32(bytes),
        }
    }

    fn encode(self, value: u32) -> Vec<u8> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        buf[..self.bytes()].to_vec()
    }
}

/// Where an operand's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSource {
    Literal(u32),
    /// Target memory at this address.
    Address(u32),
    /// Index into the caller's parameter list.
    Parameter(usize),
    /// The `$` result slot.
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub source: OperandSource,
    pub width: Width,
    /// Left shift applied to a parameter value.
    pub shift: u8,
    /// OR-ed into a parameter value after the shift.
    pub or_value: u32,
}

impl Operand {
    pub fn literal(value: u32) -> Self {
        Self::new(OperandSource::Literal(value))
    }

    pub fn address(address: u32, width: Width) -> Self {
        Self {
            width,
            ..Self::new(OperandSource::Address(address))
        }
    }

    pub fn parameter(index: usize) -> Self {
        Self::new(OperandSource::Parameter(index))
    }

    pub fn result() -> Self {
        Self::new(OperandSource::Result)
    }

    pub fn with_width(mut self, width: Width) -> Self {
        self.width = width;
        self
    }

    pub fn with_shift(mut self, shift: u8) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_or(mut self, or_value: u32) -> Self {
        self.or_value = or_value;
        self
    }

    fn new(source: OperandSource) -> Self {
        Self {
            source,
            width: Width::Word,
            shift: 0,
            or_value: 0,
        }
    }

    fn parameter_value(&self, index: usize, params: &[u32]) -> Option<u32> {
        let raw = *params.get(index)?;
        Some(raw.checked_shl(self.shift as u32).unwrap_or(0) | self.or_value)
    }
}

/// One script row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptOp {
    pub operator: Operator,
    pub left: Operand,
    pub right: Operand,
}

impl ScriptOp {
    pub fn new(operator: Operator, left: Operand, right: Operand) -> Self {
        Self {
            operator,
            left,
            right,
        }
    }
}

/// Target memory as seen by the interpreter.
pub trait MemoryAccess {
    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, SessionError>;
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), SessionError>;
}

/// Supplies init scripts for a target.
pub trait ScriptSource {
    fn script(&self, family: &str, architecture: Option<&str>, name: &str) -> Option<Vec<ScriptOp>>;
}

enum Destination {
    Memory(u32),
    Result,
}

/// Run `ops` against `mem`. Returns the value captured in the `$` slot.
///
/// A row referring to a parameter index past the end of `params` is
/// skipped. Any memory failure aborts the script.
pub fn run_script<M: MemoryAccess + ?Sized>(
    mem: &mut M,
    ops: &[ScriptOp],
    params: &[u32],
) -> Result<Option<u32>, SessionError> {
    let mut result: Option<u32> = None;

    for (row, op) in ops.iter().enumerate() {
        let destination = match op.left.source {
            OperandSource::Literal(address) | OperandSource::Address(address) => {
                Destination::Memory(address)
            }
            OperandSource::Parameter(index) => match op.left.parameter_value(index, params) {
                Some(address) => Destination::Memory(address),
                None => {
                    warn!(row, index, "Script parameter out of range, skipping row");
                    continue;
                }
            },
            OperandSource::Result => Destination::Result,
        };

        let value = match op.right.source {
            OperandSource::Literal(value) => value,
            OperandSource::Address(address) => read_value(mem, address, op.right.width)?,
            OperandSource::Parameter(index) => match op.right.parameter_value(index, params) {
                Some(value) => value,
                None => {
                    warn!(row, index, "Script parameter out of range, skipping row");
                    continue;
                }
            },
            OperandSource::Result => result.unwrap_or(0),
        };

        let width = op.left.width;
        let combined = if op.operator == Operator::Assign {
            value
        } else {
            let current = match destination {
                Destination::Memory(address) => read_value(mem, address, width)?,
                Destination::Result => result.unwrap_or(0),
            };
            match op.operator {
                Operator::Or => current | value,
                Operator::And => current & value,
                Operator::AndNot => current & !value,
                Operator::Assign => value,
            }
        };
        let value = combined & width.mask();

        match destination {
            Destination::Memory(address) => {
                debug!(
                    row,
                    address = %format!("0x{:08x}", address),
                    value = %format!("0x{:x}", value),
                    "Script write"
                );
                mem.write_memory(address, &width.encode(value))?;
            }
            Destination::Result => result = Some(value),
        }
    }

    Ok(result)
}

fn read_value<M: MemoryAccess + ?Sized>(
    mem: &mut M,
    address: u32,
    width: Width,
) -> Result<u32, SessionError> {
    let bytes = mem.read_memory(address, width.bytes())?;
    if bytes.len() < width.bytes() {
        return Err(SessionError::ReadFailed { address });
    }
    Ok(width.decode(&bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;

    /// Byte-addressed memory that can be told to fail writes.
    #[derive(Default)]
    struct FakeMemory {
        bytes: HashMap<u32, u8>,
        writes: Vec<(u32, Vec<u8>)>,
        fail_writes_at: Option<u32>,
    }

    impl FakeMemory {
        fn word(&self, address: u32) -> u32 {
            let mut buf = [0u8; 4];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *self.bytes.get(&(address + i as u32)).unwrap_or(&0);
            }
            u32::from_le_bytes(buf)
        }

        fn set_word(&mut self, address: u32, value: u32) {
            for (i, b) in value.to_le_bytes().into_iter().enumerate() {
                self.bytes.insert(address + i as u32, b);
            }
        }
    }

    impl MemoryAccess for FakeMemory {
        fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, SessionError> {
            Ok((0..len as u32)
                .map(|i| *self.bytes.get(&(address + i)).unwrap_or(&0))
                .collect())
        }

        fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), SessionError> {
            if self.fail_writes_at == Some(address) {
                return Err(SessionError::WriteFailed { address });
            }
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(address + i as u32, *b);
            }
            self.writes.push((address, data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_assign_and_read_modify_write() {
        let mut mem = FakeMemory::default();
        mem.set_word(0x4002_1018, 0x0000_0010);
        let ops = [
            ScriptOp::new(Operator::Or, Operand::literal(0x4002_1018), Operand::literal(0x4)),
            ScriptOp::new(
                Operator::AndNot,
                Operand::literal(0x4002_1018),
                Operand::literal(0x10),
            ),
            ScriptOp::new(
                Operator::Assign,
                Operand::literal(0x2000_0000),
                Operand::literal(0xDEAD_BEEF),
            ),
        ];
        assert_eq!(run_script(&mut mem, &ops, &[]).unwrap(), None);
        assert_eq!(mem.word(0x4002_1018), 0x4);
        assert_eq!(mem.word(0x2000_0000), 0xDEAD_BEEF);
        assert_eq!(mem.writes[2], (0x2000_0000, vec![0xEF, 0xBE, 0xAD, 0xDE]));
    }

    #[test]
    fn test_result_slot_captures_masked_read() {
        let mut mem = FakeMemory::default();
        mem.set_word(0xE004_2000, 0x1041_6413);
        let ops = [
            ScriptOp::new(
                Operator::Assign,
                Operand::result(),
                Operand::address(0xE004_2000, Width::Word),
            ),
            ScriptOp::new(Operator::And, Operand::result(), Operand::literal(0xFFF)),
        ];
        assert_eq!(run_script(&mut mem, &ops, &[]).unwrap(), Some(0x413));
        assert!(mem.writes.is_empty());
    }

    #[test]
    fn test_parameters_shift_and_or() {
        let mut mem = FakeMemory::default();
        let ops = [ScriptOp::new(
            Operator::Assign,
            Operand::parameter(0),
            Operand::parameter(1).with_shift(8).with_or(0x1),
        )];
        run_script(&mut mem, &ops, &[0x4000_0000, 0x5A]).unwrap();
        assert_eq!(mem.word(0x4000_0000), 0x5A01);
    }

    #[test]
    fn test_out_of_range_parameter_skips_row() {
        let mut mem = FakeMemory::default();
        let ops = [
            ScriptOp::new(Operator::Assign, Operand::literal(0x100), Operand::parameter(3)),
            ScriptOp::new(Operator::Assign, Operand::parameter(5), Operand::literal(1)),
            ScriptOp::new(Operator::Assign, Operand::literal(0x200), Operand::parameter(0)),
        ];
        run_script(&mut mem, &ops, &[7]).unwrap();
        assert_eq!(mem.writes, vec![(0x200, vec![7, 0, 0, 0])]);
    }

    #[test]
    fn test_write_failure_aborts() {
        let mut mem = FakeMemory {
            fail_writes_at: Some(0x104),
            ..Default::default()
        };
        let ops = [
            ScriptOp::new(Operator::Assign, Operand::literal(0x100), Operand::literal(1)),
            ScriptOp::new(Operator::Assign, Operand::literal(0x104), Operand::literal(2)),
            ScriptOp::new(Operator::Assign, Operand::literal(0x108), Operand::literal(3)),
        ];
        let err = run_script(&mut mem, &ops, &[]).unwrap_err();
        assert!(matches!(err, SessionError::WriteFailed { address: 0x104 }));
        assert_eq!(mem.writes.len(), 1);
    }

    #[test]
    fn test_narrow_widths() {
        let mut mem = FakeMemory::default();
        mem.set_word(0x10, 0xAABB_CCDD);
        let ops = [ScriptOp::new(
            Operator::Or,
            Operand::literal(0x10).with_width(Width::Half),
            Operand::literal(0x1_0002),
        )];
        run_script(&mut mem, &ops, &[]).unwrap();
        assert_eq!(mem.writes, vec![(0x10, vec![0xDF, 0xCC])]);
        assert_eq!(mem.word(0x10), 0xAABB_CCDF);
    }
}
