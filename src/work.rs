//! The unit of work a worker performs once admitted, and work-item naming.
//!
//! The pool protocol treats work as opaque: anything implementing [`WorkUnit`]
//! can run inside a slot. [`BracketCheck`] is the stock payload: it simulates a
//! download by sleeping, then validates the "downloaded" text by checking
//! that its brackets balance.

use std::thread;

use rand::Rng;

use crate::config::DelayRange;

const ITEM_PREFIXES: [&str; 7] = [
    "photo", "document", "archive", "setup", "video", "text", "file",
];
const ITEM_EXTENSIONS: [&str; 8] = [
    ".jpg", ".pdf", ".zip", ".exe", ".mp4", ".txt", ".docx", ".png",
];

/// Characters filler text is drawn from.
const FILLER_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789()[]{} ";

/// Name of the work item assigned to ordinal `index`.
///
/// ```
/// assert_eq!(slotgate::work::item_name(0), "photo_0.jpg");
/// assert_eq!(slotgate::work::item_name(9), "archive_9.pdf");
/// ```
pub fn item_name(index: usize) -> String {
    format!(
        "{}_{}{}",
        ITEM_PREFIXES[index % ITEM_PREFIXES.len()],
        index,
        ITEM_EXTENSIONS[index % ITEM_EXTENSIONS.len()]
    )
}

/// What a work unit reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkReport {
    pub succeeded: bool,
    /// Short human-readable explanation of the outcome.
    pub detail: String,
}

impl WorkReport {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            detail: detail.into(),
        }
    }
}

/// Work performed while holding a slot.
pub trait WorkUnit: Send + Sync {
    fn perform(&self, item: &str) -> WorkReport;
}

impl<F> WorkUnit for F
where
    F: Fn(&str) -> WorkReport + Send + Sync,
{
    fn perform(&self, item: &str) -> WorkReport {
        self(item)
    }
}

/// Sleep for a random delay, generate filler text and check its brackets.
#[derive(Debug, Clone, Default)]
pub struct BracketCheck {
    delay: DelayRange,
}

impl BracketCheck {
    pub fn new(delay: DelayRange) -> Self {
        Self { delay }
    }
}

impl WorkUnit for BracketCheck {
    fn perform(&self, _item: &str) -> WorkReport {
        let mut rng = rand::rng();
        thread::sleep(self.delay.sample(&mut rng));

        let text = filler_text(&mut rng);
        if brackets_balanced(&text) {
            WorkReport::success("brackets are balanced")
        } else {
            WorkReport::failure("brackets NOT balanced")
        }
    }
}

/// 50 to 149 random characters from [`FILLER_CHARSET`].
pub fn filler_text<R: Rng + ?Sized>(rng: &mut R) -> String {
    let len = rng.random_range(50..150);
    (0..len)
        .map(|_| FILLER_CHARSET[rng.random_range(0..FILLER_CHARSET.len())] as char)
        .collect()
}

/// True if every `(`, `[` and `{` is closed by its partner in nesting order.
pub fn brackets_balanced(text: &str) -> bool {
    let mut open = Vec::new();
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => open.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if open.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
    }
    open.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_names_cycle_prefix_and_extension() {
        assert_eq!(item_name(0), "photo_0.jpg");
        assert_eq!(item_name(6), "file_6.docx");
        assert_eq!(item_name(7), "photo_7.png");
        assert_eq!(item_name(8), "document_8.jpg");
    }

    #[test]
    fn test_brackets_balanced() {
        assert!(brackets_balanced(""));
        assert!(brackets_balanced("no brackets at all"));
        assert!(brackets_balanced("a(b[c]{d})e"));
        assert!(brackets_balanced("{[()()]}"));

        assert!(!brackets_balanced("("));
        assert!(!brackets_balanced(")("));
        assert!(!brackets_balanced("([)]"));
        assert!(!brackets_balanced("{]"));
    }

    #[test]
    fn test_filler_text_shape() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let text = filler_text(&mut rng);
            assert!((50..150).contains(&text.len()));
            assert!(text.bytes().all(|b| FILLER_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn test_bracket_check_reports_consistent_detail() {
        let unit = BracketCheck::new(DelayRange::zero());
        let report = unit.perform("photo_0.jpg");
        if report.succeeded {
            assert_eq!(report.detail, "brackets are balanced");
        } else {
            assert_eq!(report.detail, "brackets NOT balanced");
        }
    }

    #[test]
    fn test_closures_are_work_units() {
        let unit = |item: &str| WorkReport::failure(format!("refused {}", item));
        assert_eq!(unit.perform("x").detail, "refused x");
    }
}
