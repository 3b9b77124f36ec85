//! Random-access trace byte sources.

use std::io;

/// A random-access view of a trace.
///
/// The parser never seeks or buffers on behalf of the source; it issues
/// absolute-offset reads only. Implementations must tolerate concurrent
/// `read_at` calls: index construction reads batch headers from several
/// threads at once. After construction the source is accessed serially.
pub trait TraceSource: Sync {
    /// Total size of the trace in bytes.
    fn len(&self) -> u64;

    /// Whether the trace has no bytes at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read bytes starting at `offset` into `buf`, returning how many were
    /// read. A short read at end-of-trace is not an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl TraceSource for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= <[u8]>::len(self) {
            return Ok(0);
        }
        let n = buf.len().min(<[u8]>::len(self) - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

impl TraceSource for &[u8] {
    fn len(&self) -> u64 {
        <[u8] as TraceSource>::len(self)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        <[u8] as TraceSource>::read_at(self, offset, buf)
    }
}

impl TraceSource for Vec<u8> {
    fn len(&self) -> u64 {
        <[u8] as TraceSource>::len(self)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        <[u8] as TraceSource>::read_at(self, offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_read_at() {
        let data: Vec<u8> = (0..64).collect();
        let mut buf = [0u8; 16];
        assert_eq!(data.read_at(0, &mut buf).unwrap(), 16);
        assert_eq!(buf[0], 0);
        assert_eq!(data.read_at(60, &mut buf).unwrap(), 4);
        assert_eq!(buf[..4], [60, 61, 62, 63]);
        assert_eq!(data.read_at(64, &mut buf).unwrap(), 0);
        assert_eq!(data.read_at(u64::MAX, &mut buf).unwrap(), 0);
    }
}
