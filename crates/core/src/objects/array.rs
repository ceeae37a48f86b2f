//! `Array`: a dense ordered sequence of `Value`s with a per-slot
//! modified-flag used by the GC's write barrier bookkeeping (§3.2, §4.2).

use crate::value::Value;

#[derive(Debug, Default)]
pub struct ArrayObj {
    slots: Vec<Value>,
    /// Parallel to `slots`: true for any slot written since the last
    /// re-scan. The GC re-marks only the values behind `true` flags rather
    /// than re-walking the whole array on every incremental step.
    dirty: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundsError;

impl ArrayObj {
    pub fn new() -> Self {
        ArrayObj::default()
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        let dirty = vec![false; values.len()];
        ArrayObj {
            slots: values,
            dirty,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolve a possibly-negative index per the §4.6 index contract:
    /// negative counts from the end.
    fn resolve_index(&self, index: i64) -> Option<usize> {
        let len = self.slots.len() as i64;
        let idx = if index < 0 { index + len } else { index };
        if idx < 0 || idx >= len {
            None
        } else {
            Some(idx as usize)
        }
    }

    pub fn get(&self, index: i64) -> Result<Value, BoundsError> {
        self.resolve_index(index)
            .map(|i| self.slots[i])
            .ok_or(BoundsError)
    }

    pub fn set(&mut self, index: i64, value: Value) -> Result<(), BoundsError> {
        let i = self.resolve_index(index).ok_or(BoundsError)?;
        self.slots[i] = value;
        self.dirty[i] = true;
        Ok(())
    }

    pub fn push(&mut self, value: Value) {
        self.slots.push(value);
        self.dirty.push(true);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.dirty.pop();
        self.slots.pop()
    }

    pub fn slice(&self, lo: i64, hi: i64) -> Result<Vec<Value>, BoundsError> {
        let lo = self.resolve_index(lo).ok_or(BoundsError)?;
        // `hi` is an exclusive end; allow it to equal len.
        let hi = if hi == self.slots.len() as i64 {
            self.slots.len()
        } else {
            self.resolve_index(hi).ok_or(BoundsError)?
        };
        if lo > hi {
            return Err(BoundsError);
        }
        Ok(self.slots[lo..hi].to_vec())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter()
    }

    /// Values behind slots marked dirty since the last `clear_dirty`.
    pub fn dirty_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots
            .iter()
            .zip(self.dirty.iter())
            .filter(|(_, d)| **d)
            .map(|(v, _)| *v)
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_index_counts_from_end() {
        let a = ArrayObj::from_values(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(a.get(-1).unwrap(), Value::Int(3));
        assert_eq!(a.get(-3).unwrap(), Value::Int(1));
        assert!(a.get(-4).is_err());
        assert!(a.get(3).is_err());
    }

    #[test]
    fn set_marks_slot_dirty() {
        let mut a = ArrayObj::from_values(vec![Value::Int(1)]);
        a.clear_dirty();
        a.set(0, Value::Int(9)).unwrap();
        assert_eq!(a.dirty_values().collect::<Vec<_>>(), vec![Value::Int(9)]);
    }
}
