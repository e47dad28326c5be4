//! Character-addressed string editing.
//!
//! Every offset in Canop counts Unicode scalar values, so these helpers
//! translate char offsets into byte offsets before splicing.

use crate::operation::Action;

/// Number of chars in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of the char at `offset`, clamped to the end of `s`.
fn byte_index(s: &str, offset: usize) -> usize {
    s.char_indices()
        .nth(offset)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

/// Insert `text` at char `offset`, padding with spaces if `offset` lies past the end.
pub fn insert_at(s: &mut String, offset: usize, text: &str) {
    let len = char_len(s);
    if offset > len {
        s.extend(std::iter::repeat(' ').take(offset - len));
    }
    let idx = byte_index(s, offset);
    s.insert_str(idx, text);
}

/// Remove `count` chars starting at char `offset`. Returns what was removed.
pub fn remove_at(s: &mut String, offset: usize, count: usize) -> String {
    let start = byte_index(s, offset);
    let end = start + byte_index(&s[start..], count);
    s.drain(start..end).collect()
}

/// First `count` chars of `s`.
pub fn take_chars(s: &str, count: usize) -> String {
    s.chars().take(count).collect()
}

/// Smallest edit turning `old` into `new`: at most one deletion followed by
/// one insertion, both at the end of the common prefix.
pub fn minimal_diff(old: &str, new: &str) -> Vec<Action> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed: String = old_chars[prefix..old_chars.len() - suffix].iter().collect();
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut actions = Vec::new();
    if !removed.is_empty() {
        actions.push(Action::Delete {
            offset: prefix,
            text: removed,
        });
    }
    if !inserted.is_empty() {
        actions.push(Action::Insert {
            offset: prefix,
            text: inserted,
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_pads_past_end() {
        let mut s = String::from("ab");
        insert_at(&mut s, 4, "z");
        assert_eq!(s, "ab  z");
    }

    #[test]
    fn test_multibyte_offsets() {
        let mut s = String::from("héllo");
        insert_at(&mut s, 2, "✓");
        assert_eq!(s, "hé✓llo");

        let removed = remove_at(&mut s, 1, 2);
        assert_eq!(removed, "é✓");
        assert_eq!(s, "hllo");
    }

    #[test]
    fn test_remove_clamps_to_end() {
        let mut s = String::from("abc");
        let removed = remove_at(&mut s, 2, 10);
        assert_eq!(removed, "c");
        assert_eq!(s, "ab");
    }

    #[test]
    fn test_minimal_diff() {
        assert!(minimal_diff("same", "same").is_empty());

        let actions = minimal_diff("abxyze", "abcde");
        let mut replayed = String::from("abxyze");
        for action in &actions {
            match action {
                Action::Delete { offset, text } => {
                    remove_at(&mut replayed, *offset, char_len(text));
                }
                Action::Insert { offset, text } => insert_at(&mut replayed, *offset, text),
                _ => unreachable!(),
            }
        }
        assert_eq!(replayed, "abcde");
        assert_eq!(
            actions[0],
            Action::Delete {
                offset: 2,
                text: "xyz".to_string()
            }
        );
    }

    #[test]
    fn test_minimal_diff_repeated_chars() {
        // Prefix and suffix must not overlap.
        let actions = minimal_diff("aa", "aaa");
        assert_eq!(
            actions,
            vec![Action::Insert {
                offset: 2,
                text: "a".to_string()
            }]
        );
    }
}
