use anyhow::bail;

/// Cursor-style read/write surface over a packet's payload.
///
/// A packet keeps one cursor that both reads and writes advance, starting at the first
///  payload byte; header bytes are never visible through this surface. Writes past the end
///  of the current payload grow it up to the payload capacity, writes within it overwrite.
pub trait PayloadIo {
    fn payload(&self) -> &[u8];
    fn payload_capacity(&self) -> usize;
    fn cursor(&self) -> usize;
    fn set_cursor(&mut self, pos: usize);

    /// Write at the cursor, returning how many bytes fit.
    fn write_payload_at_cursor(&mut self, src: &[u8]) -> usize;

    /// Shrink the payload to `len` bytes, pulling the cursor back if it pointed past the
    ///  new end. Used to roll an atomic segment back out of a full packet.
    fn truncate_payload(&mut self, len: usize);

    fn reset_cursor(&mut self) {
        self.set_cursor(0);
    }

    fn bytes_left_to_read(&self) -> usize {
        self.payload().len().saturating_sub(self.cursor())
    }

    fn bytes_available_for_write(&self) -> usize {
        self.payload_capacity().saturating_sub(self.cursor())
    }

    /// Read up to `max_size` bytes from the cursor.
    fn read_payload_bytes(&mut self, max_size: usize) -> Vec<u8> {
        let start = self.cursor().min(self.payload().len());
        let end = (start + max_size).min(self.payload().len());
        let result = self.payload()[start..end].to_vec();
        self.set_cursor(end);
        result
    }

    /// Write a UTF-8 string with a little-endian `u32` length prefix.
    fn write_payload_string(&mut self, s: &str) -> usize {
        let mut written = self.write_payload_at_cursor(&(s.len() as u32).to_le_bytes());
        written += self.write_payload_at_cursor(s.as_bytes());
        written
    }

    /// Read a string written by [PayloadIo::write_payload_string].
    fn read_payload_string(&mut self) -> anyhow::Result<String> {
        let len_bytes = self.read_payload_bytes(size_of::<u32>());
        if len_bytes.len() < size_of::<u32>() {
            bail!("payload too short for a string length prefix");
        }
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;

        let string_bytes = self.read_payload_bytes(len);
        if string_bytes.len() < len {
            bail!("payload too short for a string of declared length {}", len);
        }
        Ok(String::from_utf8(string_bytes)?)
    }
}
