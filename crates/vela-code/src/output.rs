//! Encoder output.
//!
//! Encoding runs the same emission code in two roles: a label pass that
//! only computes byte offsets, and an output pass that produces the
//! final bytes. Offsets of variable-length encodings may depend on label
//! positions, so the driver repeats the pass until the label table stops
//! changing, then emits once more with the final table.
//!
//! References to the world outside the blob are collected as pending
//! trailer entries; the `Binary` copies them into the GC code
//! allocation's reference trailer.

use crate::label::Label;
use vgc::code::RefKind;

/// Target of a pending trailer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTarget {
    /// An absolute address outside the blob.
    Addr(usize),
    /// A position inside the blob, by label; becomes an `Inside`
    /// reference carrying the label's offset.
    Inside(Label),
}

/// One reference to be placed in the code allocation's trailer.
#[derive(Debug, Clone, Copy)]
pub struct PendingRef {
    /// Offset of the patched slot inside the code.
    pub offset: usize,
    pub kind: RefKind,
    pub target: RefTarget,
}

/// Byte sink for one encoding pass.
pub struct CodeOut {
    bytes: Vec<u8>,
    /// Label offsets resolved in this pass.
    labels: Vec<Option<usize>>,
    /// Label offsets from the previous pass, used when encoding forward
    /// references.
    prev: Vec<usize>,
    refs: Vec<PendingRef>,
}

impl CodeOut {
    pub fn new(label_count: u32, prev: Vec<usize>) -> CodeOut {
        let mut prev = prev;
        prev.resize(label_count as usize, 0);
        CodeOut {
            bytes: Vec::new(),
            labels: vec![None; label_count as usize],
            prev,
            refs: Vec::new(),
        }
    }

    #[inline]
    pub fn tell(&self) -> usize {
        self.bytes.len()
    }

    pub fn put_byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_le_bytes());
    }

    /// Pad with `nop` up to an `n`-byte boundary.
    pub fn align(&mut self, n: usize) {
        if n > 1 {
            while self.bytes.len() % n != 0 {
                self.put_byte(0x90);
            }
        }
    }

    /// Place `l` at the current position.
    pub fn mark_label(&mut self, l: Label) {
        self.labels[l.id() as usize] = Some(self.tell());
    }

    /// Best-known offset of `l`: this pass if already seen, otherwise
    /// the previous pass.
    pub fn label_offset(&self, l: Label) -> usize {
        self.labels[l.id() as usize].unwrap_or(self.prev[l.id() as usize])
    }

    /// Emit a 32-bit offset relative to the end of the slot, to `l`.
    pub fn put_rel_label(&mut self, l: Label) {
        let target = self.label_offset(l) as i64;
        let after = self.tell() as i64 + 4;
        self.put_u32((target - after) as i32 as u32);
    }

    /// Emit a `len`-byte placeholder patched from the reference trailer.
    pub fn put_ref(&mut self, kind: RefKind, target: RefTarget, len: usize) {
        self.refs.push(PendingRef {
            offset: self.tell(),
            kind,
            target,
        });
        for _ in 0..len {
            self.put_byte(0);
        }
    }

    /// The label table of this pass, with unused labels at offset 0.
    pub fn label_table(&self) -> Vec<usize> {
        self.labels.iter().map(|o| o.unwrap_or(0)).collect()
    }

    pub fn finish(self) -> (Vec<u8>, Vec<PendingRef>, Vec<usize>) {
        let table = self.label_table();
        (self.bytes, self.refs, table)
    }
}

/// Result of encoding one listing.
pub struct EncodedCode {
    pub bytes: Vec<u8>,
    pub refs: Vec<PendingRef>,
    /// Byte offset of every label; index = label id.
    pub label_offsets: Vec<usize>,
}

impl EncodedCode {
    /// Offset of the metadata table.
    pub fn meta_offset(&self) -> usize {
        self.label_offsets[Label::META.id() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_label_backward() {
        let mut out = CodeOut::new(3, Vec::new());
        out.put_byte(0x90);
        out.mark_label(Label(1));
        out.put_bytes(&[0xE9]);
        out.put_rel_label(Label(1));
        // Slot covers bytes 2..6; rel = 1 - 6 = -5.
        assert_eq!(&out.bytes[2..6], &(-5i32).to_le_bytes());
    }

    #[test]
    fn test_forward_label_uses_previous_pass() {
        let prev = vec![0, 0, 42];
        let mut out = CodeOut::new(3, prev);
        out.put_bytes(&[0xE9]);
        out.put_rel_label(Label(2));
        assert_eq!(&out.bytes[1..5], &(42i32 - 5).to_le_bytes());
    }

    #[test]
    fn test_refs_record_positions() {
        let mut out = CodeOut::new(1, Vec::new());
        out.put_byte(0x90);
        out.put_ref(RefKind::RawPtr, RefTarget::Addr(0x1234), 8);
        assert_eq!(out.refs.len(), 1);
        assert_eq!(out.refs[0].offset, 1);
        assert_eq!(out.tell(), 9);
    }

    #[test]
    fn test_align() {
        let mut out = CodeOut::new(1, Vec::new());
        out.put_byte(1);
        out.align(8);
        assert_eq!(out.tell(), 8);
    }
}
