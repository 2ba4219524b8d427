//! Code listings: an instruction sequence plus the scope tree used for
//! variable lifetime and destruction.
//!
//! A listing owns a root block that is active from `prolog` to `epilog`.
//! Blocks nest; each block is divided into parts that stage when
//! variables become eligible for destruction. A variable is visible
//! whenever its block is active, but it is only destroyed once its part
//! has been activated. This distinction matters for values: the memory
//! location is handed to a constructor before any destructor may run on
//! it, so the variable is declared in a later part than the one in
//! which its storage is first addressed.
//!
//! Labels with no following instruction are considered unused; to refer
//! to the end of a listing, append a `dat(0)`.

use crate::instr::Instr;
use crate::label::Label;
use crate::operand::Operand;
use crate::size::Size;
use crate::typedesc::TypeDesc;
use std::fmt;
use std::ops::{BitAnd, BitOr};

const INVALID: u32 = u32::MAX;

/// A variable id within one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(pub(crate) u32);

/// A block id. A block is identified by its first part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(pub(crate) u32);

/// A part id within one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Part(pub(crate) u32);

impl Var {
    pub const INVALID: Var = Var(INVALID);

    pub fn key(self) -> u32 {
        self.0
    }

    pub fn valid(self) -> bool {
        self.0 != INVALID
    }
}

impl Block {
    pub const INVALID: Block = Block(INVALID);

    pub fn key(self) -> u32 {
        self.0
    }

    pub fn valid(self) -> bool {
        self.0 != INVALID
    }

    /// The block viewed as its first part.
    pub fn part(self) -> Part {
        Part(self.0)
    }
}

impl Part {
    pub const INVALID: Part = Part(INVALID);

    pub fn key(self) -> u32 {
        self.0
    }

    pub fn valid(self) -> bool {
        self.0 != INVALID
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// When and how a variable's destructor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreeOpt(u32);

impl FreeOpt {
    pub const NONE: FreeOpt = FreeOpt(0x0);
    /// Run when an exception unwinds past the variable.
    pub const ON_EXCEPTION: FreeOpt = FreeOpt(0x1);
    /// Run on normal control-flow exit of the part.
    pub const ON_BLOCK_EXIT: FreeOpt = FreeOpt(0x2);
    pub const BOTH: FreeOpt = FreeOpt(0x3);
    /// The destructor takes the address of the variable rather than its
    /// value.
    pub const PTR: FreeOpt = FreeOpt(0x10);
    /// The stack slot holds a pointer to the real value.
    pub const INDIRECTION: FreeOpt = FreeOpt(0x20);
    /// Default: destroy on both paths.
    pub const DEFAULT: FreeOpt = FreeOpt::BOTH;

    pub fn contains(self, other: FreeOpt) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn any(self, other: FreeOpt) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> FreeOpt {
        FreeOpt(bits)
    }
}

impl BitOr for FreeOpt {
    type Output = FreeOpt;
    fn bitor(self, rhs: FreeOpt) -> FreeOpt {
        FreeOpt(self.0 | rhs.0)
    }
}

impl BitAnd for FreeOpt {
    type Output = FreeOpt;
    fn bitand(self, rhs: FreeOpt) -> FreeOpt {
        FreeOpt(self.0 & rhs.0)
    }
}

impl fmt::Display for FreeOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(FreeOpt::ON_EXCEPTION) {
            parts.push("exception");
        }
        if self.contains(FreeOpt::ON_BLOCK_EXIT) {
            parts.push("block-exit");
        }
        if self.contains(FreeOpt::PTR) {
            parts.push("ptr");
        }
        if self.contains(FreeOpt::INDIRECTION) {
            parts.push("indirect");
        }
        if parts.is_empty() {
            parts.push("none");
        }
        f.write_str(&parts.join("+"))
    }
}

/// Optional front-end information about a variable, for debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
}

struct IVar {
    /// Declaring part.
    parent: u32,
    size: Size,
    /// Set for parameters.
    param: Option<TypeDesc>,
    free_fn: Operand,
    free_opt: FreeOpt,
    info: Option<VarInfo>,
}

struct IBlock {
    /// Part this block lives in; `INVALID` for the root.
    parent: u32,
    /// Part ids in chain order; the first equals the block id.
    parts: Vec<u32>,
}

struct IPart {
    /// Index into `blocks`.
    block: u32,
    /// Position in the block's chain.
    index: u32,
    /// Variables declared here, in declaration order.
    vars: Vec<u32>,
}

/// One entry: an instruction and the labels placed before it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub instr: Instr,
    pub labels: Vec<Label>,
}

pub struct Listing {
    code: Vec<Entry>,
    /// Labels waiting for their instruction.
    next_labels: Vec<Label>,
    next_label: u32,

    params: Vec<u32>,
    vars: Vec<IVar>,
    blocks: Vec<IBlock>,
    parts: Vec<IPart>,

    /// Result of the generated function.
    pub result: TypeDesc,
    /// Member functions get a `this` pointer calling convention.
    pub member: bool,

    need_eh: bool,
}

impl Listing {
    pub fn new() -> Listing {
        Listing::with_result(false, TypeDesc::void())
    }

    pub fn with_result(member: bool, result: TypeDesc) -> Listing {
        let mut l = Listing {
            code: Vec::new(),
            next_labels: Vec::new(),
            next_label: 1,
            params: Vec::new(),
            vars: Vec::new(),
            blocks: Vec::new(),
            parts: Vec::new(),
            result,
            member,
            need_eh: false,
        };
        // The root block and its first part.
        l.blocks.push(IBlock {
            parent: INVALID,
            parts: vec![0],
        });
        l.parts.push(IPart {
            block: 0,
            index: 0,
            vars: Vec::new(),
        });
        l
    }

    /// A listing with the same scope information but no code, so ids
    /// from this listing stay valid in the shell. Backends transform
    /// into shells.
    pub fn create_shell(&self) -> Listing {
        Listing {
            code: Vec::new(),
            next_labels: Vec::new(),
            next_label: self.next_label,
            params: self.params.clone(),
            vars: self
                .vars
                .iter()
                .map(|v| IVar {
                    parent: v.parent,
                    size: v.size,
                    param: v.param.clone(),
                    free_fn: v.free_fn.clone(),
                    free_opt: v.free_opt,
                    info: v.info.clone(),
                })
                .collect(),
            blocks: self
                .blocks
                .iter()
                .map(|b| IBlock {
                    parent: b.parent,
                    parts: b.parts.clone(),
                })
                .collect(),
            parts: self
                .parts
                .iter()
                .map(|p| IPart {
                    block: p.block,
                    index: p.index,
                    vars: p.vars.clone(),
                })
                .collect(),
            result: self.result.clone(),
            member: self.member,
            need_eh: self.need_eh,
        }
    }

    // === Code ===

    pub fn push(&mut self, instr: Instr) {
        let labels = std::mem::take(&mut self.next_labels);
        self.code.push(Entry { instr, labels });
    }

    pub fn push_label(&mut self, label: Label) {
        self.next_labels.push(label);
    }

    pub fn count(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn at(&self, i: usize) -> &Instr {
        &self.code[i].instr
    }

    /// Labels attached before instruction `i`; `i == count()` gives the
    /// labels after the last instruction.
    pub fn labels(&self, i: usize) -> &[Label] {
        if i == self.code.len() {
            &self.next_labels
        } else {
            &self.code[i].labels
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.code
    }

    // === Labels ===

    /// The label where the backend deposits the variable metadata table.
    pub fn meta(&self) -> Label {
        Label::META
    }

    pub fn label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    pub fn label_count(&self) -> u32 {
        self.next_label
    }

    // === Scope management ===

    pub fn root(&self) -> Block {
        Block(0)
    }

    /// Create a block inside `parent`. Any part of the target block may
    /// be given.
    pub fn create_block(&mut self, parent: Part) -> Block {
        debug_assert!(self.valid_part(parent));
        let block_index = self.blocks.len() as u32;
        let part_id = self.parts.len() as u32;
        self.blocks.push(IBlock {
            parent: parent.0,
            parts: vec![part_id],
        });
        self.parts.push(IPart {
            block: block_index,
            index: 0,
            vars: Vec::new(),
        });
        Block(part_id)
    }

    /// Create a part after `after`. If `after` is not the last part of
    /// its block, the new part is appended at the end of the chain.
    pub fn create_part(&mut self, after: Part) -> Part {
        debug_assert!(self.valid_part(after));
        let block_index = self.parts[after.0 as usize].block;
        let part_id = self.parts.len() as u32;
        let index = self.blocks[block_index as usize].parts.len() as u32;
        self.blocks[block_index as usize].parts.push(part_id);
        self.parts.push(IPart {
            block: block_index,
            index,
            vars: Vec::new(),
        });
        Part(part_id)
    }

    /// Move the variable to a later part, delaying its destruction
    /// eligibility.
    pub fn delay(&mut self, v: Var, to: Part) {
        debug_assert!(self.valid_part(to));
        let old = self.vars[v.0 as usize].parent;
        self.parts[old as usize].vars.retain(|&id| id != v.0);
        self.parts[to.0 as usize].vars.push(v.0);
        self.vars[v.0 as usize].parent = to.0;
    }

    /// Move a parameter to position `to` in the parameter list.
    pub fn move_param(&mut self, param: Var, to: usize) {
        let Some(pos) = self.params.iter().position(|&id| id == param.0) else {
            return;
        };
        let id = self.params.remove(pos);
        self.params.insert(to.min(self.params.len()), id);
    }

    // === Variables ===

    pub fn create_var(&mut self, in_part: Part, size: Size) -> Var {
        self.create_var_free(in_part, size, Operand::None, FreeOpt::DEFAULT)
    }

    pub fn create_var_free(
        &mut self,
        in_part: Part,
        size: Size,
        free_fn: Operand,
        when: FreeOpt,
    ) -> Var {
        debug_assert!(self.valid_part(in_part));
        let id = self.vars.len() as u32;
        if when.contains(FreeOpt::ON_EXCEPTION) {
            self.need_eh = true;
        }
        self.vars.push(IVar {
            parent: in_part.0,
            size,
            param: None,
            free_fn,
            free_opt: when,
            info: None,
        });
        self.parts[in_part.0 as usize].vars.push(id);
        Var(id)
    }

    pub fn create_typed_var(&mut self, in_part: Part, ty: &TypeDesc) -> Var {
        self.create_var(in_part, ty.size())
    }

    pub fn create_param(&mut self, ty: TypeDesc) -> Var {
        self.create_param_free(ty, Operand::None, FreeOpt::NONE)
    }

    pub fn create_param_free(&mut self, ty: TypeDesc, free_fn: Operand, when: FreeOpt) -> Var {
        let id = self.vars.len() as u32;
        if when.contains(FreeOpt::ON_EXCEPTION) {
            self.need_eh = true;
        }
        self.vars.push(IVar {
            parent: 0,
            size: ty.size(),
            param: Some(ty),
            free_fn,
            free_opt: when,
            info: None,
        });
        self.params.push(id);
        Var(id)
    }

    // Convenience constructors.

    pub fn create_byte_var(&mut self, in_part: Part) -> Var {
        self.create_var(in_part, Size::BYTE)
    }

    pub fn create_int_var(&mut self, in_part: Part) -> Var {
        self.create_var(in_part, Size::INT)
    }

    pub fn create_long_var(&mut self, in_part: Part) -> Var {
        self.create_var(in_part, Size::LONG)
    }

    pub fn create_float_var(&mut self, in_part: Part) -> Var {
        self.create_var(in_part, Size::FLOAT)
    }

    pub fn create_ptr_var(&mut self, in_part: Part) -> Var {
        self.create_var(in_part, Size::PTR)
    }

    pub fn create_byte_param(&mut self) -> Var {
        self.create_param(TypeDesc::byte())
    }

    pub fn create_int_param(&mut self) -> Var {
        self.create_param(TypeDesc::int())
    }

    pub fn create_long_param(&mut self) -> Var {
        self.create_param(TypeDesc::long())
    }

    pub fn create_ptr_param(&mut self) -> Var {
        self.create_param(TypeDesc::ptr())
    }

    pub fn create_float_param(&mut self) -> Var {
        self.create_param(TypeDesc::float())
    }

    // === Queries ===

    /// The variable stored just before `v` in this stack frame: earlier
    /// in the same part, then earlier parts, then the enclosing block,
    /// and lastly the parameters. Gives every variable visible together
    /// with the start of the iteration, each exactly once.
    pub fn prev(&self, v: Var) -> Var {
        if !v.valid() {
            return Var::INVALID;
        }
        let iv = &self.vars[v.0 as usize];
        if iv.param.is_some() {
            let pos = self.params.iter().position(|&id| id == v.0).unwrap();
            return if pos > 0 {
                Var(self.params[pos - 1])
            } else {
                Var::INVALID
            };
        }

        let part = &self.parts[iv.parent as usize];
        let pos = part.vars.iter().position(|&id| id == v.0).unwrap();
        if pos > 0 {
            return Var(part.vars[pos - 1]);
        }

        self.last_var_before(iv.parent)
    }

    /// The last variable stored before the first variable of `part`,
    /// walking earlier parts of the same block and then the enclosing
    /// blocks. Falls back to the last parameter at the root.
    fn last_var_before(&self, part_id: u32) -> Var {
        let mut cur = part_id;
        loop {
            let part = &self.parts[cur as usize];
            let block = &self.blocks[part.block as usize];
            for j in (0..part.index as usize).rev() {
                let earlier = &self.parts[block.parts[j] as usize];
                if let Some(&last) = earlier.vars.last() {
                    return Var(last);
                }
            }
            let parent = block.parent;
            if parent == INVALID {
                return match self.params.last() {
                    Some(&id) => Var(id),
                    None => Var::INVALID,
                };
            }
            let parent_part = &self.parts[parent as usize];
            if let Some(&last) = parent_part.vars.last() {
                return Var(last);
            }
            cur = parent;
        }
    }

    /// Previous part: the part before `p` in its block, or the parent
    /// part of the block for a first part.
    pub fn prev_part(&self, p: Part) -> Part {
        if !p.valid() {
            return Part::INVALID;
        }
        let part = &self.parts[p.0 as usize];
        let block = &self.blocks[part.block as usize];
        if part.index > 0 {
            Part(block.parts[part.index as usize - 1])
        } else if block.parent == INVALID {
            Part::INVALID
        } else {
            Part(block.parent)
        }
    }

    /// Like `prev_part`, but for a first part returns the *last* part
    /// of the enclosing block.
    pub fn prev_stored(&self, p: Part) -> Part {
        if !p.valid() {
            return Part::INVALID;
        }
        let part = &self.parts[p.0 as usize];
        let block = &self.blocks[part.block as usize];
        if part.index > 0 {
            Part(block.parts[part.index as usize - 1])
        } else if block.parent == INVALID {
            Part::INVALID
        } else {
            let parent_block = self.parts[block.parent as usize].block;
            Part(*self.blocks[parent_block as usize].parts.last().unwrap())
        }
    }

    /// The first part of `p`'s chain; this identifies the block.
    pub fn first(&self, p: Part) -> Block {
        if !p.valid() {
            return Block::INVALID;
        }
        let block = self.parts[p.0 as usize].block;
        Block(self.blocks[block as usize].parts[0])
    }

    /// The next part in the chain, or invalid at the end.
    pub fn next(&self, p: Part) -> Part {
        if !p.valid() {
            return Part::INVALID;
        }
        let part = &self.parts[p.0 as usize];
        let block = &self.blocks[part.block as usize];
        match block.parts.get(part.index as usize + 1) {
            Some(&id) => Part(id),
            None => Part::INVALID,
        }
    }

    /// The last part of `p`'s chain.
    pub fn last(&self, p: Part) -> Part {
        if !p.valid() {
            return Part::INVALID;
        }
        let block = self.parts[p.0 as usize].block;
        Part(*self.blocks[block as usize].parts.last().unwrap())
    }

    /// The part a block lives in; invalid for the root block.
    pub fn parent(&self, b: Block) -> Part {
        if !b.valid() {
            return Part::INVALID;
        }
        let block = self.parts[b.0 as usize].block;
        let parent = self.blocks[block as usize].parent;
        if parent == INVALID {
            Part::INVALID
        } else {
            Part(parent)
        }
    }

    /// The part a variable was declared in.
    pub fn parent_of_var(&self, v: Var) -> Part {
        if !v.valid() {
            return Part::INVALID;
        }
        Part(self.vars[v.0 as usize].parent)
    }

    /// Is `v` accessible from code executing in `p`? Parameters always
    /// are; other variables when their declaring part lies at or before
    /// `p` in `p`'s block chain or any enclosing block.
    pub fn accessible(&self, v: Var, p: Part) -> bool {
        if !v.valid() || !p.valid() {
            return false;
        }
        let iv = &self.vars[v.0 as usize];
        if iv.param.is_some() {
            return true;
        }
        let decl = &self.parts[iv.parent as usize];

        let mut cur = p.0;
        loop {
            let part = &self.parts[cur as usize];
            if part.block == decl.block {
                return decl.index <= part.index;
            }
            let parent = self.blocks[part.block as usize].parent;
            if parent == INVALID {
                return false;
            }
            cur = parent;
        }
    }

    /// Is `parent` the block of `q` or any enclosing block? Reflexive
    /// and transitive.
    pub fn is_parent(&self, parent: Block, q: Part) -> bool {
        if !parent.valid() || !q.valid() {
            return false;
        }
        let target = self.parts[parent.0 as usize].block;
        let mut cur = q.0;
        loop {
            let part = &self.parts[cur as usize];
            if part.block == target {
                return true;
            }
            let up = self.blocks[part.block as usize].parent;
            if up == INVALID {
                return false;
            }
            cur = up;
        }
    }

    pub fn is_param(&self, v: Var) -> bool {
        v.valid() && self.vars[v.0 as usize].param.is_some()
    }

    pub fn param_desc(&self, v: Var) -> Option<&TypeDesc> {
        if !v.valid() {
            return None;
        }
        self.vars[v.0 as usize].param.as_ref()
    }

    pub fn var_info(&self, v: Var) -> Option<&VarInfo> {
        self.vars[v.0 as usize].info.as_ref()
    }

    pub fn set_var_info(&mut self, v: Var, info: Option<VarInfo>) {
        self.vars[v.0 as usize].info = info;
    }

    pub fn var_size(&self, v: Var) -> Size {
        self.vars[v.0 as usize].size
    }

    /// The destructor operand for a variable, or `Operand::None`.
    pub fn free_fn(&self, v: Var) -> &Operand {
        &self.vars[v.0 as usize].free_fn
    }

    pub fn free_opt(&self, v: Var) -> FreeOpt {
        self.vars[v.0 as usize].free_opt
    }

    pub fn set_free_opt(&mut self, v: Var, opt: FreeOpt) {
        if opt.contains(FreeOpt::ON_EXCEPTION) {
            self.need_eh = true;
        }
        self.vars[v.0 as usize].free_opt = opt;
    }

    /// Does this listing need exception-aware prologs? True iff any
    /// variable is destroyed on exception unwinding.
    pub fn exception_aware(&self) -> bool {
        self.need_eh
    }

    // === Enumeration ===

    pub fn all_blocks(&self) -> Vec<Block> {
        self.blocks
            .iter()
            .map(|b| Block(b.parts[0]))
            .collect()
    }

    pub fn all_parts(&self) -> Vec<Part> {
        (0..self.parts.len() as u32).map(Part).collect()
    }

    /// All variables; `all_vars()[i].key() == i`.
    pub fn all_vars(&self) -> Vec<Var> {
        (0..self.vars.len() as u32).map(Var).collect()
    }

    /// Variables declared in any part of the block.
    pub fn block_vars(&self, b: Block) -> Vec<Var> {
        if !b.valid() {
            return Vec::new();
        }
        let block = &self.blocks[self.parts[b.0 as usize].block as usize];
        let mut out = Vec::new();
        for &pid in &block.parts {
            out.extend(self.parts[pid as usize].vars.iter().map(|&id| Var(id)));
        }
        // Parameters belong to the root block.
        if b == self.root() {
            out.extend(self.params.iter().map(|&id| Var(id)));
        }
        out
    }

    /// Variables declared in this specific part.
    pub fn part_vars(&self, p: Part) -> Vec<Var> {
        if !p.valid() {
            return Vec::new();
        }
        self.parts[p.0 as usize]
            .vars
            .iter()
            .map(|&id| Var(id))
            .collect()
    }

    pub fn all_params(&self) -> Vec<Var> {
        self.params.iter().map(|&id| Var(id)).collect()
    }

    fn valid_part(&self, p: Part) -> bool {
        (p.0 as usize) < self.parts.len()
    }
}

impl Default for Listing {
    fn default() -> Self {
        Listing::new()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in self.all_params() {
            writeln!(f, "param {} : {}", p, self.var_size(p))?;
        }
        for entry in &self.code {
            for l in &entry.labels {
                writeln!(f, "{}", l)?;
            }
            writeln!(f, "    {}", entry.instr)?;
        }
        Ok(())
    }
}
