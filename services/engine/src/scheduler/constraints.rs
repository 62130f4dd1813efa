//! Placement constraints: machine requirements and unit conflicts.

use std::collections::BTreeMap;

use fleet_registry::{Requirements, Unit};

/// Shell-style glob match over a whole string.
///
/// Supports `*` (any run), `?` (any single character) and `[...]` classes
/// with ranges and `!`/`^` negation. An unterminated `[` matches literally.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0, 0);
    // Position after the last `*` and the name index it is matching from.
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    p += 1;
                    backtrack = Some((p, n));
                    continue;
                }
                '?' => {
                    p += 1;
                    n += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&pattern, p, name[n]) {
                        if matched {
                            p = next;
                            n += 1;
                            continue;
                        }
                    } else if name[n] == '[' {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                c if c == name[n] => {
                    p += 1;
                    n += 1;
                    continue;
                }
                _ => {}
            }
        }

        match backtrack {
            Some((star_p, star_n)) => {
                p = star_p;
                n = star_n + 1;
                backtrack = Some((star_p, star_n + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Evaluate the class starting at `pattern[start] == '['` against `c`.
///
/// Returns `(matched, index after ']')`, or `None` if the class is unterminated.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(pattern.get(i), Some('!') | Some('^'));
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    loop {
        let current = *pattern.get(i)?;
        if current == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        if pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).is_some_and(|&e| e != ']') {
            let end = pattern[i + 2];
            if current <= c && c <= end {
                matched = true;
            }
            i += 3;
        } else {
            if current == c {
                matched = true;
            }
            i += 1;
        }
    }
}

/// Returns true if a machine with tags `metadata` satisfies every requirement.
///
/// A key is satisfied if the machine's value for it equals any accepted
/// value. A key with no accepted values is satisfied by every machine.
pub fn requirements_satisfied(
    requirements: &Requirements,
    metadata: &BTreeMap<String, String>,
) -> bool {
    requirements.iter().all(|(key, accepted)| {
        accepted.is_empty()
            || metadata
                .get(key)
                .is_some_and(|value| accepted.iter().any(|a| a == value))
    })
}

/// Returns true if `unit` declares a conflict pattern matching `name`.
pub fn declares_conflict(unit: &Unit, name: &str) -> bool {
    unit.conflicts.iter().any(|pattern| glob_match(pattern, name))
}

/// Returns true if two units may not share a machine, in either direction.
pub fn units_conflict(a: &Unit, b: &Unit) -> bool {
    declares_conflict(a, b.name.as_str()) || declares_conflict(b, a.name.as_str())
}
