use std::collections::VecDeque;
use std::io::{Read, Write};

use byteordered::byteorder::{BigEndian, WriteBytesExt};

use crate::pdu::{read_pdu, PDataValueType, Pdu};

/// A data set writer over one presentation context.
///
/// Bytes written through the [`Write`](std::io::Write) impl
/// accumulate in a chunk sized to the peer's maximum PDU length;
/// whenever the chunk fills up, it goes out as one P-DATA-TF PDU
/// carrying a single non-last data fragment.
/// [`finish`](Self::finish) (or dropping the writer)
/// emits whatever remains as the last fragment.
///
/// Use an association's `send_pdata` method to create one.
#[must_use]
pub struct PDataWriter<W: Write> {
    stream: W,
    presentation_context_id: u8,
    /// bytes of the fragment currently being filled
    chunk: Vec<u8>,
    /// the most data one fragment may carry
    chunk_capacity: usize,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// `max_pdu_length` is the maximum PDU length
    /// advertised by the peer of the association.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        // of the whole PDU, the PDV length field (4),
        // the context id (1) and the control header (1)
        // are not fragment data
        let chunk_capacity = max_pdu_length as usize - 6;
        PDataWriter {
            stream,
            presentation_context_id,
            chunk: Vec::with_capacity(chunk_capacity),
            chunk_capacity,
            finished: false,
        }
    }

    /// Emit the current chunk as one single-fragment P-DATA-TF PDU.
    fn emit(&mut self, is_last: bool) -> std::io::Result<()> {
        let control = if is_last { 0x02 } else { 0x00 };
        let pdv_length = self.chunk.len() as u32 + 2;

        self.stream.write_u8(0x04)?;
        self.stream.write_u8(0x00)?;
        self.stream.write_u32::<BigEndian>(pdv_length + 4)?;
        self.stream.write_u32::<BigEndian>(pdv_length)?;
        self.stream.write_u8(self.presentation_context_id)?;
        self.stream.write_u8(control)?;
        self.stream.write_all(&self.chunk)?;

        self.chunk.clear();
        Ok(())
    }

    /// Mark the end of the data set,
    /// sending any remaining bytes as the last fragment.
    ///
    /// Also happens when the writer is dropped,
    /// discarding any I/O error.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        // the last fragment may legitimately be empty:
        // it still carries the last-fragment marker
        self.emit(true)?;
        self.stream.flush()
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut consumed = 0;
        while consumed < buf.len() {
            let room = self.chunk_capacity - self.chunk.len();
            let take = room.min(buf.len() - consumed);
            self.chunk.extend_from_slice(&buf[consumed..consumed + take]);
            consumed += take;
            if self.chunk.len() == self.chunk_capacity {
                self.emit(false)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // fragments only go out full or at finish
        Ok(())
    }
}

impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// A P-Data value reader.
///
/// Reads P-DATA-TF PDUs from the other node
/// and yields the bytes of the data set fragments
/// for one presentation context,
/// until the last fragment is consumed.
///
/// Use an association's `receive_pdata` method
/// to create a new P-Data value reader.
#[must_use]
pub struct PDataReader<R> {
    stream: R,
    buffer: VecDeque<u8>,
    presentation_context_id: Option<u8>,
    max_pdu_length: u32,
    last_seen: bool,
}

impl<R> PDataReader<R>
where
    R: Read,
{
    pub(crate) fn new(stream: R, max_pdu_length: u32) -> Self {
        PDataReader {
            stream,
            buffer: VecDeque::new(),
            presentation_context_id: None,
            max_pdu_length,
            last_seen: false,
        }
    }
}

impl<R> Read for PDataReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.buffer.is_empty() {
            if self.last_seen {
                // data set completely read
                return Ok(0);
            }
            let pdu = read_pdu(&mut self.stream, self.max_pdu_length, false)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            match pdu {
                Pdu::PData { data } => {
                    for pdata_value in data {
                        match pdata_value.value_type {
                            PDataValueType::Data => {
                                // fragments of one message must share
                                // the same presentation context
                                let pcid = *self
                                    .presentation_context_id
                                    .get_or_insert(pdata_value.presentation_context_id);
                                if pcid != pdata_value.presentation_context_id {
                                    return Err(std::io::Error::new(
                                        std::io::ErrorKind::InvalidData,
                                        "presentation context ID mismatch between fragments",
                                    ));
                                }
                                self.buffer.extend(pdata_value.data);
                                self.last_seen = pdata_value.is_last;
                            }
                            PDataValueType::Command => {
                                // command fragments may not follow
                                // data fragments of an unfinished data set
                                return Err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    "unexpected command fragment while reading data set",
                                ));
                            }
                        }
                    }
                }
                pdu => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "unexpected PDU while reading data set: {}",
                            pdu.short_description()
                        ),
                    ))
                }
            }
        }

        let nread = buf.len().min(self.buffer.len());
        for (b, v) in buf.iter_mut().zip(self.buffer.drain(0..nread)) {
            *b = v;
        }
        Ok(nread)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use crate::pdu::{read_pdu, PDataValueType, Pdu, MINIMUM_PDU_SIZE};

    use super::{PDataReader, PDataWriter};

    #[test]
    fn write_pdata_and_finish() {
        let presentation_context_id = 12;

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&(0..64).collect::<Vec<u8>>()).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = &buf[..];
        let same_pdu = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap();

        match same_pdu {
            Pdu::PData { data: data_1 } => {
                let data_1 = &data_1[0];

                // check that this PDU is consistent
                assert_eq!(data_1.value_type, PDataValueType::Data);
                assert!(data_1.is_last);
                assert_eq!(data_1.presentation_context_id, presentation_context_id);
                assert_eq!(data_1.data.len(), 64);
                assert_eq!(data_1.data, (0..64).collect::<Vec<u8>>());
            }
            pdu => panic!("Expected PData, got {:?}", pdu),
        }

        assert_eq!(cursor.len(), 0);
    }

    #[test]
    fn write_large_pdata_emits_fragment_per_max_pdu() {
        let presentation_context_id = 32;

        let my_data: Vec<_> = (0..9000).map(|x| x as u8).collect();

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        // data of 9000 bytes with a fragment capacity of 4090
        // must come out as ceil(9000 / 4090) = 3 PDUs
        let mut cursor = &buf[..];
        let mut all_data = Vec::new();
        let mut pdus = 0;
        while !cursor.is_empty() {
            match read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap() {
                Pdu::PData { data } => {
                    pdus += 1;
                    for pdv in data {
                        assert_eq!(pdv.presentation_context_id, presentation_context_id);
                        assert_eq!(pdv.value_type, PDataValueType::Data);
                        all_data.extend(pdv.data);
                    }
                }
                pdu => panic!("Expected PData, got {:?}", pdu),
            }
        }
        assert_eq!(pdus, 3);
        assert_eq!(all_data, my_data);
    }

    #[test]
    fn read_back_what_was_written() {
        let presentation_context_id = 5;
        let my_data: Vec<_> = (0..9000).map(|x| (x % 101) as u8).collect();

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = PDataReader::new(&buf[..], MINIMUM_PDU_SIZE);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, my_data);
    }
}
