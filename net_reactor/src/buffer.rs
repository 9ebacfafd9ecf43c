// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::IoSliceMut;
use std::os::fd::AsFd;

use nix::sys::uio::readv;

const INITIAL_SIZE: usize = 1024;

/// A growable byte buffer with separate read and write positions.
///
/// Connections use one of these for input and one for output: data read from
/// a socket is appended, consumers `peek` at the readable region and
/// `retrieve` what they have handled. Space is reclaimed by compacting the
/// already-read prefix before growing.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            data: vec![0; INITIAL_SIZE],
            read_idx: 0,
            write_idx: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_idx
    }

    pub fn is_empty(&self) -> bool {
        self.read_idx == self.write_idx
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_idx..self.write_idx]
    }

    /// Marks `len` readable bytes as consumed.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_idx += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Consumes the whole readable region and returns it as an owned vector.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Reads from `fd` into the buffer, using a 64 KiB stack buffer as the
    /// second half of a scatter read so one call can take everything the
    /// kernel has ready without pre-growing the heap allocation.
    pub fn read_fd<Fd: AsFd>(&mut self, fd: Fd) -> nix::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let n = {
            let (_, spare) = self.data.split_at_mut(self.write_idx);
            let mut iov = [IoSliceMut::new(spare), IoSliceMut::new(&mut extra)];
            readv(fd, &mut iov)?
        };
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.read_idx + self.writable_bytes() < len {
            self.data.resize(self.write_idx + len, 0);
        } else {
            // Enough total slack; move the readable region to the front.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_idx..self.write_idx, 0);
            self.read_idx = 0;
            self.write_idx = readable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());

        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        assert_eq!(buf.retrieve_all_as_bytes(), b"world");
        assert!(buf.is_empty());
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::new();
        buf.append(&[1u8; 1000]);
        buf.retrieve(900);

        // 24 writable at the back plus 900 reclaimable at the front.
        buf.append(&[2u8; 600]);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.data.len(), INITIAL_SIZE);

        buf.append(&[3u8; 2000]);
        assert_eq!(buf.readable_bytes(), 2700);
        assert!(buf.data.len() > INITIAL_SIZE);
    }

    #[test]
    fn read_fd_spills_into_extra_buffer() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        nix::unistd::write(&w, &payload).unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(&r).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
    }
}
