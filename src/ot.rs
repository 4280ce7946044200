// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The operation algebra: retain/insert/delete component sequences, their
//! application to a text buffer, and the transformation functions that make
//! concurrent operations converge.
//!
//! Everything in here is a pure value computation. All lengths and positions
//! are measured in UTF-16 code units, because that is how the editors
//! connected to us address text.

use ropey::Rope;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Length of a string in UTF-16 code units.
pub fn utf16_len(s: &str) -> u64 {
    s.encode_utf16().count() as u64
}

/// A single step of an operation, advancing through the document from
/// offset 0 onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpComponent {
    /// Skip over `n` unchanged code units.
    Retain(u64),
    /// Insert the given string at the current position.
    Insert(String),
    /// Remove `n` code units starting at the current position.
    Delete(u64),
}

/// An edit to a text document, expressed as a normalized component sequence.
///
/// Normalized means: no zero-length components, no two adjacent components of
/// the same kind, and an insert always precedes an adjacent delete. Two
/// operations with the same effect therefore compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextOperation {
    components: Vec<OpComponent>,
    /// Length of the document this operation applies to.
    base_len: u64,
    /// Length of the document after applying this operation.
    target_len: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    /// The operation's retains and deletes don't cover the document exactly.
    #[error("operation is built for a document of {expected} code units, but found {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    /// A component boundary falls outside the buffer or inside a surrogate pair.
    #[error("offset {0} is outside the buffer or not a code point boundary")]
    IndexOutOfBounds(u64),
}

/// Which of two concurrent insertions at the same position ends up first in
/// the merged document. Both peers must derive this the same way (we compare
/// author ids), otherwise their documents diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Left,
    Right,
}

impl TextOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_len(&self) -> u64 {
        self.base_len
    }

    pub fn target_len(&self) -> u64 {
        self.target_len
    }

    pub fn components(&self) -> &[OpComponent] {
        &self.components
    }

    /// True if applying this operation would leave any document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, OpComponent::Retain(_)))
    }

    pub fn retain(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(OpComponent::Retain(m)) = self.components.last_mut() {
            *m += n;
        } else {
            self.components.push(OpComponent::Retain(n));
        }
    }

    pub fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.target_len += utf16_len(s);
        let len = self.components.len();
        // An insert is kept before an adjacent delete, so that operations
        // with the same effect compare equal.
        match self.components.as_mut_slice() {
            [.., OpComponent::Insert(t)] | [.., OpComponent::Insert(t), OpComponent::Delete(_)] => {
                t.push_str(s);
            }
            [.., OpComponent::Delete(_)] => {
                self.components
                    .insert(len - 1, OpComponent::Insert(s.to_string()));
            }
            _ => self.components.push(OpComponent::Insert(s.to_string())),
        }
    }

    pub fn delete(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(OpComponent::Delete(m)) = self.components.last_mut() {
            *m += n;
        } else {
            self.components.push(OpComponent::Delete(n));
        }
    }

    /// Applies the operation to a text buffer, producing the edited buffer.
    ///
    /// Fails with `LengthMismatch` if the operation doesn't span the document
    /// exactly, and with `IndexOutOfBounds` if a component boundary would
    /// split a surrogate pair.
    pub fn apply(&self, text: &Rope) -> Result<Rope, OtError> {
        let doc_len = text.len_utf16_cu() as u64;
        if self.base_len != doc_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: doc_len,
            });
        }
        let mut result = text.clone();
        // Position in the partially edited buffer.
        let mut pos = 0u64;
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => {
                    pos += n;
                    char_index(&result, pos)?;
                }
                OpComponent::Insert(s) => {
                    let at = char_index(&result, pos)?;
                    result.insert(at, s);
                    pos += utf16_len(s);
                }
                OpComponent::Delete(n) => {
                    let start = char_index(&result, pos)?;
                    let end = char_index(&result, pos + n)?;
                    result.remove(start..end);
                }
            }
        }
        Ok(result)
    }
}

/// Maps a UTF-16 offset to a char index, rejecting offsets that are out of
/// range or inside a surrogate pair.
fn char_index(text: &Rope, pos: u64) -> Result<usize, OtError> {
    let pos = pos as usize;
    if pos > text.len_utf16_cu() {
        return Err(OtError::IndexOutOfBounds(pos as u64));
    }
    let char_idx = text.utf16_cu_to_char(pos);
    if text.char_to_utf16_cu(char_idx) != pos {
        return Err(OtError::IndexOutOfBounds(pos as u64));
    }
    Ok(char_idx)
}

/// Transforms two concurrent operations with the same base document into a
/// pair that can be applied after the respective other:
///
/// ```text
///           a
///        * ---> *
///      b |      | b'
///        v  a'  v
///        * ---> *
/// ```
///
/// `apply(apply(d, a), b') == apply(apply(d, b), a')` holds for every
/// document `d` both operations are well-formed on. When both operations
/// insert at the same position, `insert_precedence` decides whose insertion
/// comes first; callers derive it from the author ids so that every peer
/// makes the same call.
pub fn transform(
    a: &TextOperation,
    b: &TextOperation,
    insert_precedence: Precedence,
) -> Result<(TextOperation, TextOperation), OtError> {
    if a.base_len != b.base_len {
        return Err(OtError::LengthMismatch {
            expected: a.base_len,
            actual: b.base_len,
        });
    }
    let mut a_prime = TextOperation::new();
    let mut b_prime = TextOperation::new();
    let mut ops_a = a.components.iter().cloned();
    let mut ops_b = b.components.iter().cloned();
    let mut cur_a = ops_a.next();
    let mut cur_b = ops_b.next();
    loop {
        match (cur_a.take(), cur_b.take()) {
            (None, None) => break,
            (Some(OpComponent::Insert(s)), Some(OpComponent::Insert(t)))
                if insert_precedence == Precedence::Right =>
            {
                a_prime.retain(utf16_len(&t));
                b_prime.insert(&t);
                cur_a = Some(OpComponent::Insert(s));
                cur_b = ops_b.next();
            }
            (Some(OpComponent::Insert(s)), side_b) => {
                a_prime.insert(&s);
                b_prime.retain(utf16_len(&s));
                cur_a = ops_a.next();
                cur_b = side_b;
            }
            (side_a, Some(OpComponent::Insert(t))) => {
                a_prime.retain(utf16_len(&t));
                b_prime.insert(&t);
                cur_a = side_a;
                cur_b = ops_b.next();
            }
            (None, Some(_)) | (Some(_), None) => {
                return Err(OtError::LengthMismatch {
                    expected: a.base_len,
                    actual: b.base_len,
                });
            }
            (Some(OpComponent::Retain(n)), Some(OpComponent::Retain(m))) => {
                let step = n.min(m);
                a_prime.retain(step);
                b_prime.retain(step);
                cur_a = leftover_retain(n - step, &mut ops_a);
                cur_b = leftover_retain(m - step, &mut ops_b);
            }
            (Some(OpComponent::Delete(n)), Some(OpComponent::Delete(m))) => {
                // Both sides removed the same span, so neither has anything
                // left to do for it.
                let step = n.min(m);
                cur_a = leftover_delete(n - step, &mut ops_a);
                cur_b = leftover_delete(m - step, &mut ops_b);
            }
            (Some(OpComponent::Delete(n)), Some(OpComponent::Retain(m))) => {
                let step = n.min(m);
                a_prime.delete(step);
                cur_a = leftover_delete(n - step, &mut ops_a);
                cur_b = leftover_retain(m - step, &mut ops_b);
            }
            (Some(OpComponent::Retain(n)), Some(OpComponent::Delete(m))) => {
                let step = n.min(m);
                b_prime.delete(step);
                cur_a = leftover_retain(n - step, &mut ops_a);
                cur_b = leftover_delete(m - step, &mut ops_b);
            }
        }
    }
    Ok((a_prime, b_prime))
}

fn leftover_retain(
    rest: u64,
    ops: &mut impl Iterator<Item = OpComponent>,
) -> Option<OpComponent> {
    if rest > 0 {
        Some(OpComponent::Retain(rest))
    } else {
        ops.next()
    }
}

fn leftover_delete(
    rest: u64,
    ops: &mut impl Iterator<Item = OpComponent>,
) -> Option<OpComponent> {
    if rest > 0 {
        Some(OpComponent::Delete(rest))
    } else {
        ops.next()
    }
}

/// Composes two sequential operations into one, such that
/// `apply(apply(d, a), b) == apply(d, compose(a, b))`.
pub fn compose(a: &TextOperation, b: &TextOperation) -> Result<TextOperation, OtError> {
    if a.target_len != b.base_len {
        return Err(OtError::LengthMismatch {
            expected: a.target_len,
            actual: b.base_len,
        });
    }
    let mut result = TextOperation::new();
    let mut ops_a = a.components.iter().cloned();
    let mut ops_b = b.components.iter().cloned();
    let mut cur_a = ops_a.next();
    let mut cur_b = ops_b.next();
    loop {
        match (cur_a.take(), cur_b.take()) {
            (None, None) => break,
            (Some(OpComponent::Delete(n)), side_b) => {
                result.delete(n);
                cur_a = ops_a.next();
                cur_b = side_b;
            }
            (side_a, Some(OpComponent::Insert(s))) => {
                result.insert(&s);
                cur_a = side_a;
                cur_b = ops_b.next();
            }
            (None, Some(_)) | (Some(_), None) => {
                return Err(OtError::LengthMismatch {
                    expected: a.target_len,
                    actual: b.base_len,
                });
            }
            (Some(OpComponent::Retain(n)), Some(OpComponent::Retain(m))) => {
                let step = n.min(m);
                result.retain(step);
                cur_a = leftover_retain(n - step, &mut ops_a);
                cur_b = leftover_retain(m - step, &mut ops_b);
            }
            (Some(OpComponent::Retain(n)), Some(OpComponent::Delete(m))) => {
                let step = n.min(m);
                result.delete(step);
                cur_a = leftover_retain(n - step, &mut ops_a);
                cur_b = leftover_delete(m - step, &mut ops_b);
            }
            (Some(OpComponent::Insert(s)), Some(OpComponent::Retain(m))) => {
                let len = utf16_len(&s);
                if len <= m {
                    result.insert(&s);
                    cur_a = ops_a.next();
                    cur_b = leftover_retain(m - len, &mut ops_b);
                } else {
                    let (head, tail) = split_at_utf16(&s, m)?;
                    result.insert(&head);
                    cur_a = Some(OpComponent::Insert(tail));
                    cur_b = ops_b.next();
                }
            }
            (Some(OpComponent::Insert(s)), Some(OpComponent::Delete(m))) => {
                let len = utf16_len(&s);
                if len <= m {
                    // The whole insertion is deleted again, so neither
                    // survives into the composition.
                    cur_a = ops_a.next();
                    cur_b = leftover_delete(m - len, &mut ops_b);
                } else {
                    let (_, tail) = split_at_utf16(&s, m)?;
                    cur_a = Some(OpComponent::Insert(tail));
                    cur_b = ops_b.next();
                }
            }
        }
    }
    Ok(result)
}

fn split_at_utf16(s: &str, n: u64) -> Result<(String, String), OtError> {
    let mut units = 0u64;
    for (byte_idx, ch) in s.char_indices() {
        match units.cmp(&n) {
            Ordering::Equal => return Ok((s[..byte_idx].to_string(), s[byte_idx..].to_string())),
            Ordering::Greater => return Err(OtError::IndexOutOfBounds(n)),
            Ordering::Less => units += ch.len_utf16() as u64,
        }
    }
    if units == n {
        Ok((s.to_string(), String::new()))
    } else {
        Err(OtError::IndexOutOfBounds(n))
    }
}

/// Rebases a position (a cursor, or one end of a selection) through an
/// operation: insertions at or before the position shift it right, deletions
/// covering it clamp it to the deletion start.
pub fn transform_index(operation: &TextOperation, index: u64) -> u64 {
    // Distance from the current component boundary to the position, in the
    // old document.
    let mut remaining = index;
    let mut new_index = index;
    for component in &operation.components {
        match component {
            OpComponent::Retain(n) => {
                if remaining < *n {
                    break;
                }
                remaining -= n;
            }
            OpComponent::Insert(s) => {
                new_index += utf16_len(s);
            }
            OpComponent::Delete(n) => {
                let covered = (*n).min(remaining);
                new_index -= covered;
                if remaining < *n {
                    break;
                }
                remaining -= n;
            }
        }
    }
    new_index
}

// On the wire an operation is a plain array: positive numbers retain,
// negative numbers delete, strings insert. `[1, "X", -2]` retains one unit,
// inserts "X" and deletes two units.
impl Serialize for TextOperation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.components.len()))?;
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => seq.serialize_element(&(*n as i64))?,
                OpComponent::Delete(n) => seq.serialize_element(&-(*n as i64))?,
                OpComponent::Insert(s) => seq.serialize_element(s)?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TextOperation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireComponent {
            Count(i64),
            Text(String),
        }

        struct OperationVisitor;

        impl<'de> Visitor<'de> for OperationVisitor {
            type Value = TextOperation;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a sequence of numbers and strings")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut operation = TextOperation::new();
                while let Some(component) = seq.next_element::<WireComponent>()? {
                    match component {
                        WireComponent::Count(n) if n > 0 => operation.retain(n as u64),
                        WireComponent::Count(n) if n < 0 => operation.delete(n.unsigned_abs()),
                        WireComponent::Count(_) => {
                            return Err(serde::de::Error::custom("zero-length component"));
                        }
                        WireComponent::Text(s) => operation.insert(&s),
                    }
                }
                Ok(operation)
            }
        }

        deserializer.deserialize_seq(OperationVisitor)
    }
}
