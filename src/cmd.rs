use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::{
    error::{Error, Result},
    resp::{RespCodec, CRLF},
};

/// A command as sent to the server: a verb plus its arguments.
///
/// Clients send commands as a RESP array of bulk strings, the first
/// element being the command's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    name: Bytes,
    args: Vec<Bytes>,
    db: Option<u32>,
}

/// Starts building a command.
pub fn cmd(name: impl ToArg) -> Cmd {
    Cmd::new(name)
}

/// Anything that can travel as a single bulk-string argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

macro_rules! numeric_to_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

numeric_to_arg!(i32, i64, u32, u64, usize, f64);

impl Cmd {
    pub fn new(name: impl ToArg) -> Self {
        Self {
            name: name.to_arg(),
            args: Vec::new(),
            db: None,
        }
    }

    /// Builds a command from a full argument vector, verb first.
    pub fn from_args<T: ToArg>(parts: &[T]) -> Result<Self> {
        let (name, rest) = parts
            .split_first()
            .ok_or_else(|| Error::Encoding("command has no verb".into()))?;
        Ok(Self::new(name).args(rest))
    }

    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    pub fn args<T: ToArg>(mut self, args: impl IntoIterator<Item = T>) -> Self {
        self.args.extend(args.into_iter().map(|arg| arg.to_arg()));
        self
    }

    /// Runs the command against `db` without moving the connection off its
    /// currently selected database.
    pub fn in_db(mut self, db: u32) -> Self {
        self.db = Some(db);
        self
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).to_uppercase()
    }

    pub fn arg_slice(&self) -> &[Bytes] {
        &self.args
    }

    pub fn db(&self) -> Option<u32> {
        self.db
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Encoding("command verb must not be empty".into()));
        }
        Ok(())
    }

    /// Appends the RESP encoding of this command to `dst`.
    ///
    /// *<number-of-elements>\r\n followed by $<length>\r\n<data>\r\n per element.
    pub fn write_packed(&self, dst: &mut BytesMut) -> Result<()> {
        self.validate()?;

        let len_str = (self.args.len() + 1).to_string();
        dst.reserve(1 + len_str.len() + CRLF.len() + self.packed_args_len());
        dst.put_u8(b'*');
        dst.put_slice(len_str.as_bytes());
        dst.put_slice(CRLF);

        for part in std::iter::once(&self.name).chain(self.args.iter()) {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(CRLF);
            dst.put_slice(part);
            dst.put_slice(CRLF);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.write_packed(&mut buf)?;
        Ok(buf.freeze())
    }

    fn packed_args_len(&self) -> usize {
        std::iter::once(&self.name)
            .chain(self.args.iter())
            .map(|part| 1 + part.len().to_string().len() + CRLF.len() + part.len() + CRLF.len())
            .sum()
    }
}

impl Encoder<Cmd> for RespCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Cmd, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        item.write_packed(dst)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
    }
}
