//! Typed, length-prefixed reads/writes over a byte stream (component C1).
//!
//! The wire format fixes every multi-byte field to little-endian, including the
//! 8-byte "N" size field, rather than inheriting the host's native order. There
//! is no deployed reader depending on native order, so there is nothing to stay
//! compatible with by doing otherwise.

use std::io::{Read, Write};

use crate::error::{Result, SmolsyncError};

/// Reads exactly `buf.len()` bytes, looping over short reads, and fails with
/// [`SmolsyncError::Truncated`] on EOF instead of returning a partial buffer.
pub fn read_exact_framed(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
	let mut filled = 0;
	while filled < buf.len() {
		let n = r.read(&mut buf[filled..])?;
		if n == 0 {
			return Err(SmolsyncError::Truncated {
				context: "stream".to_string(),
				wanted: buf.len(),
				got: filled,
			});
		}
		filled += n;
	}
	Ok(())
}

pub fn read_u8(r: &mut impl Read) -> Result<u8> {
	let mut buf = [0u8; 1];
	read_exact_framed(r, &mut buf)?;
	Ok(buf[0])
}

pub fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
	Ok(w.write_all(&[v])?)
}

pub fn read_u32(r: &mut impl Read) -> Result<u32> {
	let mut buf = [0u8; 4];
	read_exact_framed(r, &mut buf)?;
	Ok(u32::from_le_bytes(buf))
}

pub fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
	Ok(w.write_all(&v.to_le_bytes())?)
}

/// The "N" code: a native-width unsigned size, pinned to 64-bit little-endian.
pub fn read_u64(r: &mut impl Read) -> Result<u64> {
	let mut buf = [0u8; 8];
	read_exact_framed(r, &mut buf)?;
	Ok(u64::from_le_bytes(buf))
}

pub fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
	Ok(w.write_all(&v.to_le_bytes())?)
}

pub fn read_i64(r: &mut impl Read) -> Result<i64> {
	let mut buf = [0u8; 8];
	read_exact_framed(r, &mut buf)?;
	Ok(i64::from_le_bytes(buf))
}

pub fn write_i64(w: &mut impl Write, v: i64) -> Result<()> {
	Ok(w.write_all(&v.to_le_bytes())?)
}

pub fn read_f64(r: &mut impl Read) -> Result<f64> {
	let mut buf = [0u8; 8];
	read_exact_framed(r, &mut buf)?;
	Ok(f64::from_le_bytes(buf))
}

pub fn write_f64(w: &mut impl Write, v: f64) -> Result<()> {
	Ok(w.write_all(&v.to_le_bytes())?)
}

/// Length-prefixed (u32 byte length) UTF-8 string.
pub fn read_str(r: &mut impl Read) -> Result<String> {
	let len = read_u32(r)? as usize;
	let mut buf = vec![0u8; len];
	read_exact_framed(r, &mut buf)?;
	String::from_utf8(buf).map_err(|e| SmolsyncError::Truncated {
		context: format!("string was not valid utf-8: {e}"),
		wanted: len,
		got: len,
	})
}

pub fn write_str(w: &mut impl Write, s: &str) -> Result<()> {
	write_u32(w, s.len() as u32)?;
	Ok(w.write_all(s.as_bytes())?)
}

/// A raw, unframed, fixed-size byte blob (used for 20-byte SHA-1 hashes).
pub fn read_raw<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
	let mut buf = [0u8; N];
	read_exact_framed(r, &mut buf)?;
	Ok(buf)
}

pub fn write_raw(w: &mut impl Write, bytes: &[u8]) -> Result<()> {
	Ok(w.write_all(bytes)?)
}

/// Reads and checks an 8-byte file signature, failing with
/// [`SmolsyncError::NotASmolsyncFile`] on mismatch.
pub fn check_signature(r: &mut impl Read, expected: &[u8; 8], what: &str) -> Result<()> {
	let found = read_raw::<8>(r)?;
	if &found != expected {
		return Err(SmolsyncError::NotASmolsyncFile {
			what: what.to_string(),
			found,
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn round_trips_all_primitives() {
		let mut buf = Vec::new();
		write_u8(&mut buf, 7).unwrap();
		write_u32(&mut buf, 1234).unwrap();
		write_u64(&mut buf, u64::MAX - 1).unwrap();
		write_i64(&mut buf, -42).unwrap();
		write_f64(&mut buf, 3.5).unwrap();
		write_str(&mut buf, "héllo").unwrap();
		write_raw(&mut buf, &[1, 2, 3, 4, 5]).unwrap();

		let mut c = Cursor::new(buf);
		assert_eq!(read_u8(&mut c).unwrap(), 7);
		assert_eq!(read_u32(&mut c).unwrap(), 1234);
		assert_eq!(read_u64(&mut c).unwrap(), u64::MAX - 1);
		assert_eq!(read_i64(&mut c).unwrap(), -42);
		assert_eq!(read_f64(&mut c).unwrap(), 3.5);
		assert_eq!(read_str(&mut c).unwrap(), "héllo");
		assert_eq!(read_raw::<5>(&mut c).unwrap(), [1, 2, 3, 4, 5]);
	}

	#[test]
	fn truncated_read_fails() {
		let mut c = Cursor::new(vec![0u8, 0, 0]);
		assert!(matches!(read_u32(&mut c), Err(SmolsyncError::Truncated { .. })));
	}

	#[test]
	fn signature_mismatch_is_rejected() {
		let mut c = Cursor::new(b"notasmol".to_vec());
		let err = check_signature(&mut c, b"smolimg ", "an image file").unwrap_err();
		assert!(matches!(err, SmolsyncError::NotASmolsyncFile { .. }));
	}
}
