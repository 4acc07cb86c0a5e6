//! Activation stacks.
//!
//! A stack chunk is a word array (klass [`KlassId::LOCAL_ARRAY`]) holding a
//! chain of frames that grows upward:
//!
//! ```text
//! chunk body: [last_fp][frame 0 ...][frame 1 ...] ...
//! frame:      [previous_fp][method][ip][local 0][local 1] ...
//! ```
//!
//! `last_fp` and `previous_fp` are interior pointers into the chunk itself
//! (0 terminates the chain). `ip` is an interior pointer into the frame's
//! method body (0 when unset). Which locals hold references is described by
//! the method's local oop map.
//!
//! [`KlassId::LOCAL_ARRAY`]: crate::KlassId::LOCAL_ARRAY

use crate::{Address, OopMap, WORD_BITS, header};

pub const LAST_FP: usize = 0;
pub const FIRST_FRAME: usize = 1;

pub const PREVIOUS_FP: usize = 0;
pub const METHOD: usize = 1;
pub const IP: usize = 2;
pub const LOCALS: usize = 3;
pub const FRAME_HEADER_WORDS: usize = LOCALS;

/// Method body: `[local_count][local_oop_map][code ...]`.
pub mod method {
    pub const LOCAL_COUNT: usize = 0;
    pub const LOCAL_OOP_MAP: usize = 1;
    pub const CODE: usize = 2;
}

pub const MAX_LOCALS: usize = WORD_BITS;

#[inline(always)]
pub const fn last_frame_slot(chunk: Address) -> Address {
    chunk.add_words(LAST_FP)
}

/// # Safety
/// `chunk` must be a stack chunk.
#[inline(always)]
pub unsafe fn last_frame(chunk: Address) -> Address {
    // SAFETY: by contract
    unsafe { last_frame_slot(chunk).load_address() }
}

#[inline(always)]
pub const fn previous_frame_slot(fp: Address) -> Address {
    fp.add_words(PREVIOUS_FP)
}

/// # Safety
/// `fp` must be a frame pointer.
#[inline(always)]
pub unsafe fn previous_frame(fp: Address) -> Address {
    // SAFETY: by contract
    unsafe { previous_frame_slot(fp).load_address() }
}

#[inline(always)]
pub const fn method_slot(fp: Address) -> Address {
    fp.add_words(METHOD)
}

#[inline(always)]
pub const fn ip_slot(fp: Address) -> Address {
    fp.add_words(IP)
}

#[inline(always)]
pub const fn local_slot(fp: Address, index: usize) -> Address {
    fp.add_words(LOCALS + index)
}

/// # Safety
/// `method` must be a method object.
#[inline(always)]
pub unsafe fn local_count(method: Address) -> usize {
    // SAFETY: by contract
    unsafe { method.add_words(method::LOCAL_COUNT).load() }
}

/// # Safety
/// `method` must be a method object.
#[inline(always)]
pub unsafe fn local_oop_map(method: Address) -> OopMap {
    // SAFETY: by contract
    OopMap(unsafe { method.add_words(method::LOCAL_OOP_MAP).load() })
}

#[inline(always)]
pub const fn code_slot(method: Address, index: usize) -> Address {
    method.add_words(method::CODE + index)
}

/// Writes the method prologue words and its code.
///
/// # Safety
/// `method` must be a word array of length `method::CODE + code.len()`.
pub unsafe fn initialize_method(method: Address, local_count: usize, locals: OopMap, code: &[usize]) {
    debug_assert!(local_count <= MAX_LOCALS);
    debug_assert!(locals.extent() <= local_count);
    // SAFETY: by contract
    unsafe {
        method.add_words(method::LOCAL_COUNT).store(local_count);
        method.add_words(method::LOCAL_OOP_MAP).store(locals.0);
        for (i, &word) in code.iter().enumerate() {
            code_slot(method, i).store(word);
        }
    }
}

/// Frames of a chunk from the most recent to the oldest.
pub struct Frames {
    fp: Address,
}

impl Iterator for Frames {
    type Item = Address;

    #[inline]
    fn next(&mut self) -> Option<Address> {
        if self.fp.is_null() {
            return None;
        }
        let fp = self.fp;
        // SAFETY: the chain was valid when the iterator was created
        self.fp = unsafe { previous_frame(fp) };
        Some(fp)
    }
}

/// # Safety
/// `chunk` must be a stack chunk whose frame chain points into itself.
#[inline]
pub unsafe fn frames(chunk: Address) -> Frames {
    // SAFETY: by contract
    Frames {
        fp: unsafe { last_frame(chunk) },
    }
}

/// Index of the first unused chunk word.
///
/// # Safety
/// `chunk` must be a stack chunk whose frame chain points into itself.
pub unsafe fn used_words(chunk: Address) -> usize {
    // SAFETY: by contract
    unsafe {
        let fp = last_frame(chunk);
        if fp.is_null() {
            return FIRST_FRAME;
        }
        let method = method_slot(fp).load_address();
        let locals = if method.is_null() {
            0
        } else {
            local_count(method)
        };
        fp.diff(chunk) / crate::WORD_SIZE + FRAME_HEADER_WORDS + locals
    }
}

/// Pushes a frame for `method`, with `ip` at code word `ip_index`.
/// Returns the new frame pointer, or `None` when the chunk is full.
///
/// # Safety
/// `chunk` must be a stack chunk, `method` a method object.
pub unsafe fn push_frame(chunk: Address, method: Address, ip_index: usize) -> Option<Address> {
    // SAFETY: by contract
    unsafe {
        let capacity = header::array_length(chunk);
        let start = used_words(chunk);
        let locals = local_count(method);
        if start + FRAME_HEADER_WORDS + locals > capacity {
            return None;
        }
        let fp = chunk.add_words(start);
        previous_frame_slot(fp).store_address(last_frame(chunk));
        method_slot(fp).store_address(method);
        ip_slot(fp).store_address(code_slot(method, ip_index));
        for i in 0..locals {
            local_slot(fp, i).store(0);
        }
        last_frame_slot(chunk).store_address(fp);
        Some(fp)
    }
}

/// Drops the most recent frame.
///
/// # Safety
/// `chunk` must be a stack chunk with at least one frame.
pub unsafe fn pop_frame(chunk: Address) {
    // SAFETY: by contract
    unsafe {
        let fp = last_frame(chunk);
        debug_assert!(!fp.is_null());
        last_frame_slot(chunk).store_address(previous_frame(fp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::encode_array_length;

    fn fake_array(words: &mut [usize], length: usize) -> Address {
        words[0] = encode_array_length(length);
        Address::from_ptr(words.as_mut_ptr()).add_words(2)
    }

    #[test]
    fn test_push_frames_links_chain() {
        let mut method_words = [0usize; 2 + 6];
        let method = fake_array(&mut method_words, 6);
        unsafe { initialize_method(method, 2, OopMap::from_fields(&[1]), &[10, 11, 12, 13]) };

        let mut chunk_words = [0usize; 2 + 16];
        let chunk = fake_array(&mut chunk_words, 16);

        unsafe {
            assert_eq!(used_words(chunk), FIRST_FRAME);
            let f0 = push_frame(chunk, method, 0).expect("room for frame 0");
            let f1 = push_frame(chunk, method, 3).expect("room for frame 1");
            assert_eq!(f0, chunk.add_words(FIRST_FRAME));
            assert_eq!(f1, f0.add_words(FRAME_HEADER_WORDS + 2));
            assert_eq!(previous_frame(f1), f0);
            assert!(previous_frame(f0).is_null());
            assert_eq!(ip_slot(f1).load_address(), code_slot(method, 3));
            assert_eq!(frames(chunk).collect::<Vec<_>>(), vec![f1, f0]);

            // 11 words used, a third frame needs 5 more
            assert!(push_frame(chunk, method, 0).is_some());
            assert!(push_frame(chunk, method, 0).is_none());

            pop_frame(chunk);
            assert_eq!(last_frame(chunk), f1);
        }
    }
}
