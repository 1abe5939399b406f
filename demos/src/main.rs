//! Box-rearranger round trip over 4 ranks, matching the scenario in
//! spec.md §8: a 1-D array of length 4, one element per compute rank,
//! written through 2 I/O ranks and read back.

use std::sync::Arc;

use mpi::traits::*;

use pio_core::{ElementType, IoSystem, OpenMode, RearrangerKind};
use pio_driver_posix::PosixDriver;

fn main() {
    let universe = mpi::initialize().expect("MPI initialization failed");
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    if size != 4 {
        if rank == 0 {
            eprintln!("box-roundtrip expects exactly 4 ranks, got {size}");
        }
        return;
    }

    let num_iotasks = 2;
    let mut sys = IoSystem::init_intracomm(world, num_iotasks);

    let gdimlen = vec![4i64];
    let map = vec![(rank + 1) as i64];
    let decomp_id = sys
        .init_decomp(gdimlen, map, ElementType::Float, RearrangerKind::Box)
        .expect("init_decomp failed");

    let driver = Arc::new(PosixDriver::new());
    let path = "/tmp/pio-demo-box-roundtrip.dat";
    let file_id = sys
        .create(driver.clone(), path, OpenMode::CLOBBER | OpenMode::WRITE | OpenMode::CREATE_IF_MISSING)
        .expect("create failed");
    let ncid = sys.file(file_id).expect("file lookup failed").ncid;
    let varid = driver.define_var(ncid, vec![4], 4).expect("define_var failed");

    let local_data = [rank as f32];
    sys.write_darray(file_id, varid, decomp_id, &local_data)
        .expect("write_darray failed");
    sys.close(file_id).expect("close failed");

    let reopened = sys
        .open(driver.clone(), path, OpenMode::WRITE)
        .expect("reopen failed");
    let ncid2 = sys.file(reopened).expect("file lookup failed").ncid;
    let _ = driver.define_var(ncid2, vec![4], 4).expect("define_var (reopen) failed");

    let read_back: Vec<f32> = sys
        .read_darray(reopened, varid, decomp_id)
        .expect("read_darray failed");
    sys.close(reopened).expect("close failed");

    assert_eq!(read_back, local_data, "round trip mismatch on rank {rank}");
    println!("rank {rank}: round trip OK, value={:?}", read_back);

    sys.free_decomp(decomp_id).expect("free_decomp failed");
}
