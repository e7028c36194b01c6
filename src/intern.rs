use fxhash::FxHashSet;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

lazy_static! {
    static ref TABLE: Mutex<FxHashSet<&'static str>> = Mutex::new(FxHashSet::default());
}

/// A process-wide interned string.
///
/// Equal content always maps to the same backing allocation, so equality and
/// hashing work on the pointer alone. Ordering compares content so that
/// collections keyed by `IStr` iterate deterministically.
#[derive(Copy, Clone)]
pub struct IStr(&'static str);

/// Interns `text`, returning its stable handle.
///
/// Interning takes a global lock and is expected off the hot path; all
/// subsequent comparisons are pointer comparisons.
pub fn intern(text: &str) -> IStr {
    let mut table = TABLE.lock();
    match table.get(text) {
        Some(existing) => IStr(existing),
        None => {
            let stable: &'static str = Box::leak(text.to_string().into_boxed_str());
            table.insert(stable);
            IStr(stable)
        }
    }
}

impl IStr {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl PartialEq for IStr {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ptr() == other.0.as_ptr()
    }
}

impl Eq for IStr {}

impl Hash for IStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as usize).hash(state);
    }
}

impl PartialOrd for IStr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IStr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(other.0)
    }
}

impl Deref for IStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.0
    }
}

impl fmt::Display for IStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for IStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<&str> for IStr {
    fn from(text: &str) -> IStr {
        intern(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_same_pointer() {
        let a = intern("position");
        let b = intern(&"position".to_string());
        assert_eq!(a, b);
        assert_eq!(a.as_str().as_ptr(), b.as_str().as_ptr());
    }

    #[test]
    fn different_content_differs() {
        assert_ne!(intern("left"), intern("right"));
    }

    #[test]
    fn orders_by_content() {
        let mut names = vec![intern("b"), intern("a"), intern("c")];
        names.sort();
        let strs: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        assert_eq!(strs, vec!["a", "b", "c"]);
    }
}
