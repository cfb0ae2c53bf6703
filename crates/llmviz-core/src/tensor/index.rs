/// Lazy row-major iterator over every index tuple of a shape.
///
/// Cloning yields an independent iterator from the same position, so a fresh
/// clone taken before iteration restarts the sequence.
#[derive(Debug, Clone)]
pub struct IndexIter {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl IndexIter {
    pub fn new(shape: &[usize]) -> Self {
        let next = if shape.iter().any(|&d| d == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            shape: shape.to_vec(),
            next,
        }
    }

    /// Rewinds to the first index.
    pub fn reset(&mut self) {
        *self = IndexIter::new(&self.shape);
    }
}

impl Iterator for IndexIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;

        let mut following = current.clone();
        let mut axis = following.len();
        while axis > 0 {
            axis -= 1;
            following[axis] += 1;
            if following[axis] < self.shape[axis] {
                self.next = Some(following);
                return Some(current);
            }
            following[axis] = 0;
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.next {
            None => (0, Some(0)),
            Some(_) => (1, Some(self.shape.iter().product())),
        }
    }
}
