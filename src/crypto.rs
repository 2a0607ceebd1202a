use std::io::Write;

use ck_meow::Meow;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

const COMMIT_LABEL: &[u8] = b"keyshare-custody v0.1.0 step commitment";
const COMMIT_LEN: usize = 32;

struct MeowWriter<'a>(&'a mut Meow);

impl<'a> Write for MeowWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.ad(buf, true);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Represents a binding commitment to some value.
///
/// Step receipts keep one of these instead of the request itself.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Commitment([u8; COMMIT_LEN]);

impl AsRef<[u8]> for Commitment {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Commitment {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Commitment {}

/// Commit to an arbitrary serializable value.
pub fn commit<T: Serialize + ?Sized>(val: &T) -> Commitment {
    let mut meow = Meow::new(COMMIT_LABEL);

    meow.ad(&[], false);
    // Writing into the sponge never fails.
    let _ = rmp_serde::encode::write(&mut MeowWriter(&mut meow), val);

    let mut out = [0u8; COMMIT_LEN];
    meow.prf(&mut out, false);

    Commitment(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_commit_is_deterministic() {
        let a = commit(&(3u8, "hello", vec![1u8, 2, 3]));
        let b = commit(&(3u8, "hello", vec![1u8, 2, 3]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_commit_binds_value() {
        let a = commit(&(3u8, vec![1u8, 2, 3]));
        let b = commit(&(3u8, vec![1u8, 2, 4]));
        let c = commit(&(4u8, vec![1u8, 2, 3]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
