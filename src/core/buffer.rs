/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp;

pub fn trim_for_display(s: &str, max: usize) -> String {
    // NOTE: O(n)
    let char_len = s.chars().count();

    if char_len > max && max >= 7 {
        let dist = max / 2;
        let mut left_end = 0;
        let mut right_start = 0;

        // NOTE: O(n)
        for (i, (pos, _)) in s.char_indices().enumerate() {
            // dist guaranteed to be < char_len
            if i == dist {
                left_end = pos;
            }

            // (char_len - dist + 3) guaranteed to be < char_len
            if i == char_len - dist + 3 {
                right_start = pos;
            }
        }

        let left = &s[..left_end];
        let right = &s[right_start..];

        format!("{}...{}", left, right)
    } else {
        s.to_owned()
    }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}

pub fn find_byte(haystack: &[u8], b: u8) -> Option<usize> {
    memchr::memchr(b, haystack)
}

// strips any number of trailing carriage returns. some CGI programs emit
// "\r\r\n" line endings
pub fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();

    while end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }

    &line[..end]
}

/// Bytes received but not yet consumed by a parser.
///
/// The readable region lies between the read cursor (`start`) and the write
/// cursor (`end`). The backing allocation starts small and doubles on demand,
/// but never beyond `max` bytes.
pub struct ParseBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    max: usize,
}

impl ParseBuffer {
    // panics if initial is larger than max
    pub fn new(initial: usize, max: usize) -> Self {
        assert!(initial <= max);

        Self {
            buf: vec![0; initial],
            start: 0,
            end: 0,
            max,
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    // drops the allocation. the buffer remains usable and will grow again
    // if written to
    pub fn release(&mut self) {
        self.buf = Vec::new();
        self.clear();
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn read_avail(&self) -> usize {
        self.end - self.start
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(self.start + amount <= self.end);

        self.start += amount;

        if self.start == self.end {
            self.clear();
        }
    }

    // space available for appending, counting space reclaimable by
    // compaction and growth
    pub fn write_avail(&self) -> usize {
        self.max - self.read_avail()
    }

    pub fn is_full(&self) -> bool {
        self.write_avail() == 0
    }

    /// Appends as much of `src` as fits and returns the number of bytes
    /// copied.
    ///
    /// The unconsumed tail is first moved down to the front of the
    /// allocation, then the allocation is grown if needed.
    pub fn append(&mut self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        // copy down
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        let want = cmp::min(self.end + src.len(), self.max);

        if want > self.buf.len() {
            let mut new_len = cmp::max(self.buf.len(), 1);

            while new_len < want {
                new_len *= 2;
            }

            self.buf.resize(cmp::min(new_len, self.max), 0);
        }

        let size = cmp::min(self.buf.len() - self.end, src.len());

        self.buf[self.end..(self.end + size)].copy_from_slice(&src[..size]);
        self.end += size;

        size
    }
}
