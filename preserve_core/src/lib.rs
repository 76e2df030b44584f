pub mod vfs;
pub mod hasher;
pub mod adapters;
pub mod checkpoint;
pub mod inventory;
pub mod bytecount;
pub mod comparison;
pub mod verify;

pub use vfs::{LocalVfs, MemoryVfs};
pub use hasher::FileHasher;
pub use adapters::{load_inventory, read_inventory, CsvRecordWriter, LoadedInventory, ParseOptions, RecordReader};
pub use checkpoint::{Checkpoint, CheckpointLog};
pub use inventory::{BuildOptions, BuildOutcome, CsvFileSink, InventoryBuilder, RecordSink};
pub use bytecount::{human_bytes, summarize, ByteCount, ExtensionTotals};
pub use comparison::ComparisonEngine;
pub use verify::{Verifier, VerifyOutcome, VerifySide};
