use std::collections::HashMap;
use std::sync::Arc;

/// Interns directory paths so that files sharing a parent directory share one string.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PathPool {
    paths: Vec<Arc<str>>,
    indexes: HashMap<Arc<str>, usize>,
}

impl PathPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, path: &str) -> usize {
        if let Some(index) = self.indexes.get(path) {
            return *index;
        }
        let path: Arc<str> = Arc::from(path);
        let index = self.paths.len();
        self.paths.push(path.clone());
        self.indexes.insert(path, index);
        index
    }

    pub fn get(&self, index: usize) -> &str {
        &self.paths[index]
    }

    pub fn paths(&self) -> &[Arc<str>] {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern() {
        let mut pool = PathPool::new();
        assert_eq!(pool.intern("a"), 0);
        assert_eq!(pool.intern("a/b"), 1);
        assert_eq!(pool.intern("a"), 0);
        assert_eq!(pool.intern("a/b"), 1);
        assert_eq!(pool.intern("c"), 2);
        assert_eq!(pool.paths().len(), 3);

        assert_eq!(pool.get(0), "a");
        assert_eq!(pool.get(1), "a/b");
    }

    #[test]
    fn shared_storage() {
        let mut pool = PathPool::new();
        let x = pool.intern("x/y");
        let y = pool.intern(&String::from("x/y"));
        assert_eq!(x, y);
        assert!(Arc::ptr_eq(&pool.paths()[x], &pool.paths()[y]));
    }
}
