//! Core of a parallel array I/O library: group-communication façade,
//! decomposition/rearrangement engine, flow-controlled exchange, buffered
//! write path, async I/O-rank message loop, and the public `IoSystem`/`File`
//! API built on top of them.

pub mod async_loop;
pub mod comm;
pub mod decomp_file;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod iodesc;
pub mod rearrange;
pub mod region;
pub mod registry;
pub mod swapm;
pub mod system;
pub mod typetag;
pub mod write_buffer;

pub use async_loop::{run_message_loop, LoopState, OpenComponents, PioOpcode};
pub use comm::{DerivedType, FlowControlOpts, GroupComm};
pub use decomp_file::{read_decomp_file, write_decomp_file, DecompFile};
pub use driver::{ArrayFileDriver, DriverToken, OpenMode, VarMeta, WireFormat};
pub use error::{ErrorPolicy, PioError};
pub use iodesc::{IoDesc, RearrangerKind};
pub use region::Region;
pub use system::{File, IoSystem};
pub use typetag::{ElementType, Stride};
