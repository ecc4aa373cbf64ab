use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::ConnectionError;

/// Accumulator for one logical message that arrives as a series of chunk frames. Keyed by
///  the 16-bit message id the sender chose; a different id may interleave on the wire, the
///  reader routes each frame here by id.
pub struct ChunkAssembler {
    msg_id: u16,
    data: BytesMut,
    num_chunks: u32,
}

impl ChunkAssembler {
    fn new(msg_id: u16) -> ChunkAssembler {
        ChunkAssembler {
            msg_id,
            data: BytesMut::new(),
            num_chunks: 0,
        }
    }

    fn add_chunk(&mut self, payload: &[u8], max_assembled_size: usize) -> Result<(), ConnectionError> {
        if self.data.len() + payload.len() > max_assembled_size {
            return Err(ConnectionError::ReassemblyOverflow {
                msg_id: self.msg_id,
                size: self.data.len() + payload.len(),
                max: max_assembled_size,
            });
        }
        self.data.extend_from_slice(payload);
        self.num_chunks += 1;
        Ok(())
    }

    fn take(&mut self) -> Bytes {
        self.num_chunks = 0;
        self.data.split().freeze()
    }

    fn reset(&mut self, msg_id: u16) {
        self.msg_id = msg_id;
        self.num_chunks = 0;
        self.data.clear();
    }
}

/// The per-connection set of in-flight reassemblies, plus one idle assembler kept around
///  so the common case of a single chunked message at a time does not allocate.
pub struct ChunkAssemblers {
    max_assembled_size: usize,
    active: FxHashMap<u16, ChunkAssembler>,
    idle: Option<ChunkAssembler>,
}

impl ChunkAssemblers {
    pub fn new(max_assembled_size: usize) -> ChunkAssemblers {
        ChunkAssemblers {
            max_assembled_size,
            active: FxHashMap::default(),
            idle: None,
        }
    }

    pub fn on_chunk(&mut self, msg_id: u16, payload: &[u8]) -> Result<(), ConnectionError> {
        let assembler = self.active.entry(msg_id).or_insert_with(|| {
            match self.idle.take() {
                Some(mut recycled) => {
                    recycled.reset(msg_id);
                    recycled
                }
                None => ChunkAssembler::new(msg_id),
            }
        });
        assembler.add_chunk(payload, self.max_assembled_size)
    }

    /// Completes the series and yields the concatenated message. An end-chunk without any
    ///  preceding chunk is a single-shot message and delivered as-is.
    pub fn on_end_chunk(&mut self, msg_id: u16, payload: &[u8]) -> Result<Bytes, ConnectionError> {
        match self.active.remove(&msg_id) {
            Some(mut assembler) => {
                assembler.add_chunk(payload, self.max_assembled_size)?;
                let complete = assembler.take();
                if self.idle.is_none() {
                    self.idle = Some(assembler);
                }
                Ok(complete)
            }
            None => {
                trace!("end-chunk for message {} without prior chunks - single-shot delivery", msg_id);
                Ok(Bytes::copy_from_slice(payload))
            }
        }
    }

    pub fn num_in_flight(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::two_chunks(vec![vec![0xAA, 0xBB], vec![0xCC]], vec![0xDD], vec![0xAA, 0xBB, 0xCC, 0xDD])]
    #[case::one_chunk(vec![vec![1, 2, 3]], vec![], vec![1, 2, 3])]
    #[case::end_only(vec![], vec![9, 8], vec![9, 8])]
    fn test_reassembly(#[case] chunks: Vec<Vec<u8>>, #[case] end: Vec<u8>, #[case] expected: Vec<u8>) {
        let mut assemblers = ChunkAssemblers::new(1024);

        for chunk in chunks {
            assemblers.on_chunk(7, &chunk).unwrap();
        }
        let complete = assemblers.on_end_chunk(7, &end).unwrap();

        assert_eq!(complete.as_ref(), expected.as_slice());
        assert_eq!(assemblers.num_in_flight(), 0);
    }

    #[test]
    fn test_interleaved_ids() {
        let mut assemblers = ChunkAssemblers::new(1024);

        assemblers.on_chunk(1, &[1, 1]).unwrap();
        assemblers.on_chunk(2, &[2, 2]).unwrap();
        assemblers.on_chunk(1, &[1]).unwrap();
        assert_eq!(assemblers.num_in_flight(), 2);

        assert_eq!(assemblers.on_end_chunk(2, &[2]).unwrap().as_ref(), &[2, 2, 2]);
        assert_eq!(assemblers.on_end_chunk(1, &[]).unwrap().as_ref(), &[1, 1, 1]);
        assert_eq!(assemblers.num_in_flight(), 0);
    }

    #[test]
    fn test_overflow() {
        let mut assemblers = ChunkAssemblers::new(4);

        assemblers.on_chunk(7, &[1, 2, 3]).unwrap();
        let result = assemblers.on_chunk(7, &[4, 5]);
        assert!(matches!(result, Err(ConnectionError::ReassemblyOverflow { msg_id: 7, size: 5, max: 4 })));
    }

    #[test]
    fn test_assembler_is_recycled() {
        let mut assemblers = ChunkAssemblers::new(1024);

        assemblers.on_chunk(1, &[1]).unwrap();
        assemblers.on_end_chunk(1, &[1]).unwrap();
        assert!(assemblers.idle.is_some());

        // the recycled assembler starts empty under its new id
        assemblers.on_chunk(9, &[9]).unwrap();
        assert!(assemblers.idle.is_none());
        assert_eq!(assemblers.on_end_chunk(9, &[]).unwrap().as_ref(), &[9]);
    }
}
