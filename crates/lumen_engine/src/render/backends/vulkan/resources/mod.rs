//! Vulkan resource management
//!
//! Buffers, descriptors, uploads, meshes and acceleration structures.

/// Device memory allocation
pub mod memory;

/// Buffer types (vertex, index, uniform, staging)
pub mod buffer;

/// Descriptor set layouts, pools and writers
pub mod descriptor_set;

/// Fenced transfer submissions
pub mod upload;

/// GPU-resident meshes
pub mod mesh_registry;

/// Ray tracing acceleration structures
pub mod acceleration_structure;

pub use acceleration_structure::{align_up, transform_matrix, AccelerationStructure, BlasInstance, TopLevel};
pub use buffer::{Buffer, PerFrameBuffers, HOST_MEMORY};
pub use descriptor_set::{
    validate_write, BindingInfo, BindingMap, DescriptorBudget, DescriptorPool, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorWriter,
};
pub use memory::{select_memory_type, MemoryAllocator};
pub use mesh_registry::{GpuMesh, MeshRegistry};
pub use upload::{StagedCopy, TicketLedger, UploadQueue, UploadTicket};
