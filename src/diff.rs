//! Word-boundary diff between two revisions of a message, rendered in the
//! IRC convention `s/old/new/`.

const SEPARATORS: &[char] = &[
    ' ', '.', ',', ':', ';', '\t', '\n', '(', ')', '[', ']', '{', '}',
];

/// Split into word pieces, each carrying its leading separator. The exact
/// bucketing matters: the diff works on these pieces, not on characters.
fn wordsplit(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut bucket = String::new();
    for c in text.chars() {
        if SEPARATORS.contains(&c) {
            pieces.push(std::mem::take(&mut bucket));
        }
        bucket.push(c);
    }
    if !bucket.is_empty() {
        pieces.push(bucket);
    }
    pieces
}

fn join_inner(pieces: &[String], skip: usize, drop_tail: usize) -> String {
    let end = pieces.len().saturating_sub(drop_tail);
    if skip >= end {
        return String::new();
    }
    pieces[skip..end].concat()
}

/// Compute the minimal word-level replacement turning `a` into `b`.
///
/// Returns the empty string when the two are equal, otherwise a single
/// `s/old/new/` line. An empty `old` is rendered as `$`, marking an
/// append at the end of the message.
pub fn seddiff(a: &str, b: &str) -> String {
    if a == b {
        return String::new();
    }

    let l1 = wordsplit(a);
    let l2 = wordsplit(b);

    let mut prefix = 0;
    while prefix < l1.len() && prefix < l2.len() && l1[prefix] == l2[prefix] {
        prefix += 1;
    }
    let mut postfix = 0;
    while postfix < l1.len()
        && postfix < l2.len()
        && l1[l1.len() - 1 - postfix] == l2[l2.len() - 1 - postfix]
    {
        postfix += 1;
    }

    // When one side inserted words, the boundary between "kept" and
    // "changed" is ambiguous; widening the window by one piece on each side
    // keeps a word of context in the output.
    if prefix > 0 && postfix > 0 && l1.len() != l2.len() {
        prefix -= 1;
        postfix -= 1;
    }

    let old = join_inner(&l1, prefix, postfix);
    let new = join_inner(&l2, prefix, postfix);

    let old = old.trim();
    let new = new.trim();
    format!("s/{}/{}/", if old.is_empty() { "$" } else { old }, new)
}
