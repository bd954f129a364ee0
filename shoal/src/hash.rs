use crate::Error;

pub const SHA1_LENGTH: usize = 20;

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1(pub(crate) [u8; SHA1_LENGTH]);

impl Sha1 {
    pub fn hash(buf: &[u8]) -> Sha1 {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::default();
        hasher.update(buf);
        Sha1(hasher.finalize().into())
    }

    pub fn from_hex(hex: &str) -> Result<Sha1, Error> {
        let mut digest = [0u8; SHA1_LENGTH];
        hex::decode_to_slice(hex, &mut digest)
            .map_err(|err| Error::Descriptor(format!("invalid sha1 digest {hex:?}: {err}")))?;
        Ok(Sha1(digest))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sha1(")?;
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        f.write_str(")")?;
        Ok(())
    }
}

impl std::fmt::Display for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        Ok(())
    }
}
