//! Tokenizer shared by keyword scoring, reranking, and the demo embedder.
//!
//! Latin-script text is split on non-alphanumeric characters and
//! lower-cased. CJK ideographs carry no spaces, so each one becomes its own
//! token.

use std::collections::{BTreeSet, HashMap};

const STOPWORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "from", "has", "had", "how",
    "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our",
    "so", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "to", "up", "was", "we", "were", "what", "when", "which", "who", "why", "will",
    "with", "would", "you", "的", "了", "在", "是", "我", "有", "和", "就", "不", "都", "也",
    "很", "到", "说", "要", "去", "你", "会", "着", "这", "那", "他", "她", "它", "们",
];

/// Whether `c` is a CJK ideograph.
fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF
    )
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

fn flush(buf: &mut String, out: &mut Vec<String>) {
    if buf.is_empty() {
        return;
    }
    let token = buf.to_lowercase();
    buf.clear();
    if token.chars().count() >= 2 && !is_stopword(&token) {
        out.push(token);
    }
}

/// Split text into normalized terms, in order, with repeats.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();

    for c in text.chars() {
        if is_cjk(c) {
            flush(&mut buf, &mut out);
            let mut s = String::new();
            s.push(c);
            if !is_stopword(&s) {
                out.push(s);
            }
        } else if c.is_alphanumeric() {
            buf.push(c);
        } else {
            flush(&mut buf, &mut out);
        }
    }
    flush(&mut buf, &mut out);

    out
}

/// Distinct terms of a text.
pub fn unique_terms(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Term counts of a token stream.
pub fn term_frequencies(tokens: &[String]) -> HashMap<String, u32> {
    let mut tf = HashMap::new();
    for token in tokens {
        *tf.entry(token.clone()).or_insert(0) += 1;
    }
    tf
}
