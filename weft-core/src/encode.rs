use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::hash::StrHash;
use crate::opcode::Opcode;
use crate::variant::Variant;

// Inline Variant tags used by PushValue.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_HASH: u8 = 4;

/// Append-only instruction emitter with site backpatching.
///
/// One writer covers a whole module; every node's instructions land in the
/// same buffer and the node records `(offset, length)` slices into it.
#[derive(Debug, Default)]
pub struct CodeWriter {
    buf: Vec<u8>,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pos(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn emit_op(&mut self, op: Opcode) {
        self.buf.push(op as u8);
    }

    pub fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_hash(&mut self, h: StrHash) {
        self.emit_u32(h.value());
    }

    pub fn emit_variant(&mut self, v: &Variant) {
        match v {
            Variant::Null => self.emit_u8(TAG_NULL),
            Variant::Bool(b) => {
                self.emit_u8(TAG_BOOL);
                self.emit_u8(u8::from(*b));
            }
            Variant::Int(i) => {
                self.emit_u8(TAG_INT);
                self.buf.extend_from_slice(&i.to_le_bytes());
            }
            Variant::Float(f) => {
                self.emit_u8(TAG_FLOAT);
                self.emit_u32(f.to_bits());
            }
            Variant::Hash(h) => {
                self.emit_u8(TAG_HASH);
                self.emit_hash(*h);
            }
        }
    }

    /// Emit a placeholder jump displacement and return the patch site.
    pub fn reserve_jump(&mut self) -> u32 {
        let site = self.pos();
        self.emit_u16(0);
        site
    }

    /// Patch a reserved displacement so that it lands on `target`.
    ///
    /// The displacement is relative to the position immediately after the
    /// 2-byte field itself.
    pub fn patch_jump(&mut self, site: u32, target: u32) -> Result<()> {
        let base = i64::from(site) + 2;
        let disp = i64::from(target) - base;
        let Ok(disp) = i16::try_from(disp) else {
            bail!("jump displacement out of i16 range: {}", disp);
        };
        let site = site as usize;
        if site + 2 > self.buf.len() {
            bail!("patch site out of bounds: {}", site);
        }
        LittleEndian::write_i16(&mut self.buf[site..site + 2], disp);
        Ok(())
    }

    /// Emit a complete backward (or already-known) jump displacement.
    pub fn emit_jump_to(&mut self, target: u32) -> Result<()> {
        let site = self.reserve_jump();
        self.patch_jump(site, target)
    }
}

/// Bounds-checked little-endian reader over one node's instruction slice.
///
/// Positions are relative to the node start; the reader refuses to run past
/// the node's `(offset, length)` window.
#[derive(Debug, Clone, Copy)]
pub struct CodeReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> CodeReader<'a> {
    pub fn new(code: &'a [u8], pos: u32) -> Self {
        Self {
            code,
            pos: pos as usize,
        }
    }

    pub fn pos(&self) -> u32 {
        self.pos as u32
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.code.len() {
            bail!(
                "instruction stream truncated at {} (need {} of {})",
                self.pos,
                n,
                self.code.len()
            );
        }
        let s = &self.code[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_hash(&mut self) -> Result<StrHash> {
        Ok(StrHash::from_raw(self.read_u32()?))
    }

    pub fn read_opcode(&mut self) -> Result<Opcode> {
        let at = self.pos;
        let b = self.read_u8()?;
        match Opcode::decode(b) {
            Some(op) => Ok(op),
            None => bail!("unknown opcode 0x{:02x} at {}", b, at),
        }
    }

    pub fn read_variant(&mut self) -> Result<Variant> {
        let tag = self.read_u8()?;
        Ok(match tag {
            TAG_NULL => Variant::Null,
            TAG_BOOL => Variant::Bool(self.read_u8()? != 0),
            TAG_INT => Variant::Int(self.read_u32()? as i32),
            TAG_FLOAT => Variant::Float(f32::from_bits(self.read_u32()?)),
            TAG_HASH => Variant::Hash(self.read_hash()?),
            _ => bail!("unknown variant tag {} at {}", tag, self.pos - 1),
        })
    }

    /// Apply a relative displacement read at the current position.
    pub fn jump_by(&mut self, disp: i16) -> Result<()> {
        let target = self.pos as i64 + i64::from(disp);
        if target < 0 || target > self.code.len() as i64 {
            bail!("jump target out of node bounds: {}", target);
        }
        self.pos = target as usize;
        Ok(())
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = pos as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn variant_round_trip() {
        let values = [
            Variant::Null,
            Variant::Bool(true),
            Variant::Bool(false),
            Variant::Int(-40_000),
            Variant::Float(2.5),
            Variant::Hash(StrHash::new("door")),
        ];
        let mut w = CodeWriter::new();
        for v in &values {
            w.emit_variant(v);
        }
        let bytes = w.into_bytes();
        let mut r = CodeReader::new(&bytes, 0);
        for v in &values {
            assert_eq!(&r.read_variant().unwrap(), v);
        }
        assert!(r.at_end());
    }

    #[test]
    fn jump_patch_lands_after_displacement_field() {
        let mut w = CodeWriter::new();
        w.emit_op(Opcode::JumpIfFalse);
        let site = w.reserve_jump();
        w.emit_op(Opcode::NoOp);
        w.emit_op(Opcode::NoOp);
        let target = w.pos();
        w.emit_op(Opcode::Yield);
        w.patch_jump(site, target).unwrap();

        let bytes = w.into_bytes();
        let mut r = CodeReader::new(&bytes, 0);
        assert_eq!(r.read_opcode().unwrap(), Opcode::JumpIfFalse);
        let disp = r.read_i16().unwrap();
        r.jump_by(disp).unwrap();
        assert_eq!(r.read_opcode().unwrap(), Opcode::Yield);
    }

    #[test]
    fn backward_jump() {
        let mut w = CodeWriter::new();
        let top = w.pos();
        w.emit_op(Opcode::NoOp);
        w.emit_op(Opcode::Jump);
        w.emit_jump_to(top).unwrap();
        let bytes = w.into_bytes();

        let mut r = CodeReader::new(&bytes, 1);
        assert_eq!(r.read_opcode().unwrap(), Opcode::Jump);
        let disp = r.read_i16().unwrap();
        assert!(disp < 0);
        r.jump_by(disp).unwrap();
        assert_eq!(r.pos(), top);
    }

    #[test]
    fn reader_rejects_truncation_and_bad_bytes() {
        let bytes = [0xffu8, 0x01];
        let mut r = CodeReader::new(&bytes, 0);
        assert!(r.read_opcode().is_err());
        let mut r = CodeReader::new(&bytes, 1);
        assert!(r.read_u32().is_err());
    }
}
