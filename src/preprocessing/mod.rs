//! Point-cloud preprocessing utilities.

mod voxel;

pub use voxel::VoxelGridFilter;
