//! Object and pointer-array scanning.
//!
//! How pointers are treated is described by a [`Scanner`]: `fix1` is a
//! cheap filter that may be called with interior pointers, `fix2` may
//! relocate the referent and update the slot. Scanners are instantiated
//! on the stack by each scan so the compiler can keep their state in
//! registers.
//!
//! The object walk itself understands the format from [`super`]: code
//! allocations scan their trailer (self-pointer first, so a moved block
//! is rescanned at its new address), regular objects scan the offsets
//! listed in their header, arrays repeat the offsets per element, weak
//! arrays splat slots the scanner nulls, and padding/forwarders are
//! skipped.

use super::*;
use crate::code;

/// Offset from a descriptor slot's stored pointer back to the start of
/// the descriptor allocation. Zero here: the slot stores the client
/// pointer itself. Kept as an explicit adjustment for layouts where the
/// dispatch table is not at the allocation base.
pub const DESC_ALLOC_OFFSET: usize = 0;

/// What to do with one object during a filtered walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    /// Do not scan this object at all.
    None,
    /// Fix only the object's header reference.
    HeaderOnly,
    /// Scan the whole object.
    All,
}

/// A pointer-fixing visitor.
pub trait Scanner {
    type Error;

    /// Quick filter, callable with interior pointers and arbitrary
    /// words. Returns true if `fix2` must run for this slot.
    fn fix1(&mut self, ptr: *const u8) -> bool;

    /// Process one slot whose value passed `fix1`. May relocate the
    /// referent and rewrite the slot.
    ///
    /// # Safety
    /// `slot` must be a valid, writable pointer slot.
    unsafe fn fix2(&mut self, slot: *mut *mut u8) -> Result<(), Self::Error>;

    /// Filter for object headers ([`GcType`] pointers). Defaults to
    /// leaving headers alone.
    fn fix_header1(&mut self, header: *const GcType) -> bool {
        let _ = header;
        false
    }

    /// Process a header slot whose value passed `fix_header1`.
    ///
    /// # Safety
    /// `slot` must point at a live header pointer.
    unsafe fn fix_header2(&mut self, slot: *mut *const GcType) -> Result<(), Self::Error> {
        let _ = slot;
        Ok(())
    }
}

#[inline]
unsafe fn fix12<S: Scanner>(s: &mut S, slot: *mut *mut u8) -> Result<(), S::Error> {
    if s.fix1(*slot) {
        s.fix2(slot)?;
    }
    Ok(())
}

/// Fix the descriptor slot at the start of `FixedObj`/`Type` objects,
/// adjusting by [`DESC_ALLOC_OFFSET`] between slot value and allocation
/// base.
#[inline]
unsafe fn fix_desc_slot<S: Scanner>(s: &mut S, at: *mut u8) -> Result<(), S::Error> {
    let slot = at as *mut *mut u8;
    let d = *slot;
    if s.fix1(d) {
        let mut base = (d as usize - DESC_ALLOC_OFFSET) as *mut u8;
        s.fix2(&mut base)?;
        *slot = (base as usize + DESC_ALLOC_OFFSET) as *mut u8;
    }
    Ok(())
}

/// Fix an object's header reference, replacing the header in place
/// without atomics (scans run inside the stop-the-world window).
#[inline]
unsafe fn fix_header<S: Scanner>(s: &mut S, client: *mut u8) -> Result<(), S::Error> {
    let h = header(client);
    if s.fix_header1(h) {
        let mut new_header = h;
        s.fix_header2(&mut new_header)?;
        replace_header_unsafe(client, new_header);
    }
    Ok(())
}

/// Fix every offset listed in `ty` relative to `base`, starting at
/// offset index `from`.
#[inline]
unsafe fn fix_offsets<S: Scanner>(
    s: &mut S,
    ty: &GcType,
    from: usize,
    base: *mut u8,
) -> Result<(), S::Error> {
    for &offset in &ty.offsets()[from..] {
        fix12(s, base.add(offset) as *mut *mut u8)?;
    }
    Ok(())
}

/// Scan an array of `count` pointer slots, as used for roots.
///
/// # Safety
/// `base` must point at `count` writable pointer slots.
pub unsafe fn scan_array<S: Scanner>(
    s: &mut S,
    base: *mut u8,
    count: usize,
) -> Result<(), S::Error> {
    let slots = base as *mut *mut u8;
    for i in 0..count {
        fix12(s, slots.add(i))?;
    }
    Ok(())
}

/// Scan all objects stored back-to-back in `[base, limit)`.
///
/// # Safety
/// The range must be filled entirely with initialized allocations;
/// `base` and `limit` are client pointers.
pub unsafe fn scan_objects<S: Scanner>(
    s: &mut S,
    base: *mut u8,
    limit: *mut u8,
) -> Result<(), S::Error> {
    scan_objects_if(s, |_, _| ScanAction::All, base, limit)
}

/// Scan objects in `[base, limit)` for which the predicate asks for it.
/// The predicate sees each object's client pointer and the end of its
/// client data.
///
/// # Safety
/// Same as [`scan_objects`].
pub unsafe fn scan_objects_if<S, P>(
    s: &mut S,
    mut predicate: P,
    base: *mut u8,
    limit: *mut u8,
) -> Result<(), S::Error>
where
    S: Scanner,
    P: FnMut(*const u8, *const u8) -> ScanAction,
{
    let mut at = base;
    while at < limit {
        // Compute the size before fixing anything: a forwarder installed
        // by the scanner must not shorten the walk.
        let next = skip(at);

        let action = predicate(at, (next as usize - HEADER_SIZE) as *const u8);
        if action == ScanAction::None {
            at = next;
            continue;
        }

        if is_code(at) {
            scan_code(s, at)?;
            at = next;
            continue;
        }

        let h = header(at);
        match (*h).kind {
            kind::FIXED_OBJ => {
                fix_desc_slot(s, at)?;
                fix_header(s, at)?;
                if action == ScanAction::All {
                    fix_offsets(s, &*header(at), 0, at)?;
                }
            }
            kind::FIXED => {
                fix_header(s, at)?;
                if action == ScanAction::All {
                    fix_offsets(s, &*header(at), 0, at)?;
                }
            }
            kind::TYPE => {
                fix_desc_slot(s, at)?;
                fix_header(s, at)?;
                if action == ScanAction::All {
                    let ty = &*header(at);
                    // The first listed field holds the GcType describing
                    // instances; it needs header treatment, not fix2.
                    let slot = at.add(ty.offsets()[0]) as *mut *const GcType;
                    if s.fix_header1(*slot) {
                        s.fix_header2(slot)?;
                    }
                    fix_offsets(s, ty, 1, at)?;
                }
            }
            kind::ARRAY => {
                fix_header(s, at)?;
                if action == ScanAction::All {
                    let ty = &*header(at);
                    let count = (*(at as *const ArrayHeader)).count;
                    let mut element = at.add(ARRAY_HEADER_SIZE);
                    for _ in 0..count {
                        fix_offsets(s, ty, 0, element)?;
                        element = element.add(ty.stride);
                    }
                }
            }
            kind::WEAK_ARRAY => {
                fix_header(s, at)?;
                if action == ScanAction::All {
                    let ty = &*header(at);
                    let count = weak_count(&*(at as *const WeakHeader));
                    let mut element = at.add(ARRAY_HEADER_SIZE);
                    for _ in 0..count {
                        for &offset in ty.offsets() {
                            let slot = element.add(offset) as *mut *mut u8;
                            if s.fix1(*slot) {
                                s.fix2(slot)?;
                                if (*slot).is_null() {
                                    weak_splat(&mut *(at as *mut WeakHeader));
                                }
                            }
                        }
                        element = element.add(ty.stride);
                    }
                }
            }
            kind::GC_TYPE => {
                // Only the back-reference needs scanning.
                fix12(s, &mut (*(at as *mut GcType)).type_obj as *mut *mut u8)?;
            }
            kind::PAD0 | kind::PAD | kind::FWD1 | kind::FWD | kind::GC_TYPE_FWD => {}
            other => {
                log::error!("unknown object kind {:#x} scanned at {:p}", other, at);
                debug_assert!(false, "unknown object kind scanned");
            }
        }

        at = next;
    }

    Ok(())
}

/// Visit every pointer slot of one object, using its header's offset
/// list (and the reference trailer for code allocations).
///
/// # Safety
/// `obj` must be a client pointer to an initialized allocation.
pub unsafe fn traverse(obj: *mut u8, f: &mut dyn FnMut(*mut *mut u8)) {
    struct Visit<'a> {
        f: &'a mut dyn FnMut(*mut *mut u8),
    }

    impl Scanner for Visit<'_> {
        type Error = ();

        fn fix1(&mut self, _ptr: *const u8) -> bool {
            true
        }

        unsafe fn fix2(&mut self, slot: *mut *mut u8) -> Result<(), ()> {
            (self.f)(slot);
            Ok(())
        }
    }

    let mut v = Visit { f };
    scan_objects(&mut v, obj, skip(obj)).ok();
}

/// Scan one code allocation: self-pointer, tagged trailer refs, then
/// rewrite the machine code from the updated pointers.
unsafe fn scan_code<S: Scanner>(s: &mut S, at: *mut u8) -> Result<(), S::Error> {
    let trailer = code_refs(at);

    // Self-pointer first: a relocating scanner that moves this block will
    // fix the trailer copy at the new location, which is the one the
    // rewrite below must read.
    fix12(s, &mut (*trailer).reserved as *mut *mut u8)?;
    debug_assert_eq!((*trailer).reserved, at, "code self-pointer out of sync");

    let refs = (*trailer).refs_mut();
    for r in refs {
        debug_assert!(r.offset < code_size(at), "code ref offset out of bounds");
        if r.kind.scanned() {
            fix12(s, &mut r.pointer as *mut *mut u8)?;
        }
    }

    code::update_ptrs(at, trailer);
    Ok(())
}
