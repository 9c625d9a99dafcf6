//! Descriptor set layouts, pools and writers
//!
//! Declaring bindings ([`DescriptorSetLayoutBuilder`]), owning capacity
//! ([`DescriptorPool`]) and populating sets ([`DescriptorWriter`]) are kept
//! separate. Consumers declare what they allocate as a [`DescriptorBudget`];
//! the renderer sums the budgets and creates the one pool they all share.

use ash::{vk, Device};
use std::collections::BTreeMap;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Declared shape of one binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingInfo {
    /// Descriptor type
    pub ty: vk::DescriptorType,
    /// Shader stages that see the binding
    pub stages: vk::ShaderStageFlags,
    /// Descriptor count (upper bound when `variable`)
    pub count: u32,
    /// Count chosen at allocation time; must be the highest binding
    pub variable: bool,
}

/// Binding index to declared shape
pub type BindingMap = BTreeMap<u32, BindingInfo>;

/// Descriptor set layout builder
#[derive(Debug, Default, Clone)]
pub struct DescriptorSetLayoutBuilder {
    bindings: BindingMap,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a binding; declaring the same index twice is an error
    pub fn add_binding(
        self,
        binding: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> VulkanResult<Self> {
        self.insert(binding, BindingInfo { ty, stages, count, variable: false })
    }

    /// Declare a variable-count binding holding at most `max_count` descriptors
    pub fn add_variable_binding(
        self,
        binding: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        max_count: u32,
    ) -> VulkanResult<Self> {
        self.insert(binding, BindingInfo { ty, stages, count: max_count, variable: true })
    }

    fn insert(mut self, binding: u32, info: BindingInfo) -> VulkanResult<Self> {
        if self.bindings.contains_key(&binding) {
            debug_assert!(false, "descriptor binding {} declared twice", binding);
            return Err(VulkanError::DuplicateBinding { binding });
        }
        self.bindings.insert(binding, info);
        Ok(self)
    }

    /// Bindings declared so far
    pub fn bindings(&self) -> &BindingMap {
        &self.bindings
    }

    /// Create the native layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        if let Some((&last, _)) = self.bindings.iter().next_back() {
            if let Some((&binding, _)) = self.bindings.iter().find(|(&b, info)| info.variable && b != last) {
                return Err(VulkanError::InvalidOperation {
                    reason: format!("variable-count binding {} must be the highest binding", binding),
                });
            }
        }

        let native: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .map(|(&binding, info)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(info.ty)
                    .descriptor_count(info.count)
                    .stage_flags(info.stages)
                    .build()
            })
            .collect();
        let flags: Vec<vk::DescriptorBindingFlags> = self
            .bindings
            .values()
            .map(|info| {
                if info.variable {
                    vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                        | vk::DescriptorBindingFlags::PARTIALLY_BOUND
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect();

        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);
        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&native);
        if self.bindings.values().any(|info| info.variable) {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };
        log::debug!("Created descriptor set layout with {} bindings", native.len());

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: BindingMap,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &BindingMap {
        &self.bindings
    }

    /// Declared count of the variable binding, if the layout has one
    pub fn variable_count(&self) -> Option<u32> {
        self.bindings.values().find(|info| info.variable).map(|info| info.count)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Sets and descriptors a consumer allocates from the shared pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DescriptorBudget {
    sets: u32,
    descriptors: BTreeMap<i32, u32>,
}

impl DescriptorBudget {
    /// An empty budget
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `sets` sets
    pub fn sets(mut self, sets: u32) -> Self {
        self.sets = self.sets.saturating_add(sets);
        self
    }

    /// Reserve `count` descriptors of type `ty`
    pub fn descriptors(mut self, ty: vk::DescriptorType, count: u32) -> Self {
        let total = self.descriptors.entry(ty.as_raw()).or_insert(0);
        *total = total.saturating_add(count);
        self
    }

    /// Add another consumer's reservation
    pub fn merge(mut self, other: &DescriptorBudget) -> Self {
        self.sets = self.sets.saturating_add(other.sets);
        for (&ty, &count) in &other.descriptors {
            let total = self.descriptors.entry(ty).or_insert(0);
            *total = total.saturating_add(count);
        }
        self
    }

    /// Total sets, the pool's `max_sets`
    pub fn set_count(&self) -> u32 {
        self.sets
    }

    /// One pool size per descriptor type with a non-zero count
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.descriptors
            .iter()
            .filter(|&(_, &count)| count > 0)
            .map(|(&ty, &count)| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(ty),
                descriptor_count: count,
            })
            .collect()
    }
}

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
    free_individual: bool,
}

impl DescriptorPool {
    /// Create a pool with explicit capacity
    pub fn new(
        device: Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        free_individual: bool,
    ) -> VulkanResult<Self> {
        let flags = if free_individual {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };
        log::debug!("Created descriptor pool for {} sets", max_sets);

        Ok(Self { pool, device, free_individual })
    }

    /// Create a pool holding exactly `budget`
    pub fn from_budget(device: Device, budget: &DescriptorBudget, free_individual: bool) -> VulkanResult<Self> {
        let pool_sizes = budget.pool_sizes();
        if budget.set_count() == 0 || pool_sizes.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "descriptor pool budget is empty".to_string(),
            });
        }
        Self::new(device, budget.set_count(), &pool_sizes, free_individual)
    }

    /// Allocate one set; `variable_count` sizes the layout's variable binding
    pub fn allocate_descriptor_set(
        &self,
        layout: &DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout.handle()];
        let counts = [variable_count.or_else(|| layout.variable_count()).unwrap_or(0)];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder().descriptor_counts(&counts);

        let mut alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        if layout.variable_count().is_some() {
            alloc_info = alloc_info.push_next(&mut variable_info);
        }

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "descriptor pool returned no sets".to_string(),
        })
    }

    /// Return sets to the pool
    pub fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        if !self.free_individual {
            return Err(VulkanError::InvalidOperation {
                reason: "pool was created without FREE_DESCRIPTOR_SET".to_string(),
            });
        }
        unsafe { Ok(self.device.free_descriptor_sets(self.pool, sets)?) }
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Check a write of `actual` descriptors against the declared binding
pub fn validate_write(bindings: &BindingMap, binding: u32, actual: u32) -> VulkanResult<BindingInfo> {
    let info = *bindings
        .get(&binding)
        .ok_or(VulkanError::UnknownBinding { binding })?;
    let matches = if info.variable {
        actual >= 1 && actual <= info.count
    } else {
        actual == info.count
    };
    if matches {
        Ok(info)
    } else {
        Err(VulkanError::DescriptorCountMismatch {
            binding,
            expected: info.count,
            actual,
        })
    }
}

enum WriteResource {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

struct PendingWrite {
    binding: u32,
    ty: vk::DescriptorType,
    resource: WriteResource,
}

/// Accumulates writes for one set, validated against its layout
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a DescriptorPool,
    writes: Vec<PendingWrite>,
}

impl<'a> DescriptorWriter<'a> {
    /// Writer for sets of `layout` allocated from `pool`
    pub fn new(layout: &'a DescriptorSetLayout, pool: &'a DescriptorPool) -> Self {
        Self {
            layout,
            pool,
            writes: Vec::new(),
        }
    }

    fn push(mut self, binding: u32, count: usize, resource: WriteResource) -> VulkanResult<Self> {
        let count = u32::try_from(count).map_err(|_| VulkanError::InvalidOperation {
            reason: "descriptor write too large".to_string(),
        })?;
        let info = validate_write(self.layout.bindings(), binding, count)?;
        self.writes.push(PendingWrite {
            binding,
            ty: info.ty,
            resource,
        });
        Ok(self)
    }

    /// Write buffer descriptors to `binding`
    pub fn write_buffers(self, binding: u32, infos: &[vk::DescriptorBufferInfo]) -> VulkanResult<Self> {
        self.push(binding, infos.len(), WriteResource::Buffers(infos.to_vec()))
    }

    /// Write one whole-buffer descriptor to `binding`
    pub fn write_buffer(self, binding: u32, buffer: vk::Buffer, range: vk::DeviceSize) -> VulkanResult<Self> {
        let info = vk::DescriptorBufferInfo { buffer, offset: 0, range };
        self.write_buffers(binding, &[info])
    }

    /// Write image descriptors to `binding`
    pub fn write_images(self, binding: u32, infos: &[vk::DescriptorImageInfo]) -> VulkanResult<Self> {
        self.push(binding, infos.len(), WriteResource::Images(infos.to_vec()))
    }

    /// Write one image descriptor to `binding`
    pub fn write_image(
        self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> VulkanResult<Self> {
        let info = vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        };
        self.write_images(binding, &[info])
    }

    /// Write top-level acceleration structures to `binding`
    pub fn write_acceleration_structures(
        self,
        binding: u32,
        structures: &[vk::AccelerationStructureKHR],
    ) -> VulkanResult<Self> {
        self.push(
            binding,
            structures.len(),
            WriteResource::AccelerationStructures(structures.to_vec()),
        )
    }

    /// Allocate a fresh set and populate it
    pub fn build(self) -> VulkanResult<vk::DescriptorSet> {
        let variable = self.variable_write_count();
        let set = self.pool.allocate_descriptor_set(self.layout, variable)?;
        self.overwrite(set);
        Ok(set)
    }

    /// Populate an already-allocated set, keeping its handle
    pub fn overwrite(self, set: vk::DescriptorSet) {
        let acceleration_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = self
            .writes
            .iter()
            .filter_map(|write| match &write.resource {
                WriteResource::AccelerationStructures(structures) => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(structures)
                        .build(),
                ),
                _ => None,
            })
            .collect();

        let mut acceleration_index = 0;
        let native: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|write| {
                let mut native = vk::WriteDescriptorSet {
                    dst_set: set,
                    dst_binding: write.binding,
                    dst_array_element: 0,
                    descriptor_type: write.ty,
                    ..Default::default()
                };
                match &write.resource {
                    WriteResource::Buffers(infos) => {
                        native.descriptor_count = infos.len() as u32;
                        native.p_buffer_info = infos.as_ptr();
                    }
                    WriteResource::Images(infos) => {
                        native.descriptor_count = infos.len() as u32;
                        native.p_image_info = infos.as_ptr();
                    }
                    WriteResource::AccelerationStructures(structures) => {
                        native.descriptor_count = structures.len() as u32;
                        native.p_next = std::ptr::addr_of!(acceleration_infos[acceleration_index]).cast();
                        acceleration_index += 1;
                    }
                }
                native
            })
            .collect();

        unsafe { self.pool.device.update_descriptor_sets(&native, &[]) };
    }

    fn variable_write_count(&self) -> Option<u32> {
        let (binding, _) = self
            .layout
            .bindings()
            .iter()
            .find(|(_, info)| info.variable)?;
        self.writes.iter().find(|w| w.binding == *binding).map(|w| match &w.resource {
            WriteResource::Buffers(v) => v.len() as u32,
            WriteResource::Images(v) => v.len() as u32,
            WriteResource::AccelerationStructures(v) => v.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(builder: DescriptorSetLayoutBuilder, binding: u32) -> VulkanResult<DescriptorSetLayoutBuilder> {
        builder.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX, 1)
    }

    #[test]
    fn test_bindings_are_kept_in_index_order() {
        let builder = uniform(uniform(DescriptorSetLayoutBuilder::new(), 2).unwrap(), 0).unwrap();
        let indices: Vec<u32> = builder.bindings().keys().copied().collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "declared twice"))]
    fn test_duplicate_binding_rejected() {
        let builder = uniform(DescriptorSetLayoutBuilder::new(), 1).unwrap();
        let result = builder.add_binding(
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
            1,
        );
        assert!(matches!(result, Err(VulkanError::DuplicateBinding { binding: 1 })));
    }

    #[test]
    fn test_write_validation() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX, 1)
            .unwrap()
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT, 4)
            .unwrap();
        let bindings = builder.bindings();

        assert_eq!(validate_write(bindings, 0, 1).unwrap().ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(matches!(
            validate_write(bindings, 5, 1),
            Err(VulkanError::UnknownBinding { binding: 5 })
        ));
        assert!(matches!(
            validate_write(bindings, 1, 3),
            Err(VulkanError::DescriptorCountMismatch { binding: 1, expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_variable_binding_accepts_partial_writes() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_variable_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT, 8)
            .unwrap();
        assert!(validate_write(builder.bindings(), 0, 3).is_ok());
        assert!(validate_write(builder.bindings(), 0, 9).is_err());
        assert!(validate_write(builder.bindings(), 0, 0).is_err());
    }

    #[test]
    fn test_budgets_merge_by_descriptor_type() {
        let globals = DescriptorBudget::new()
            .sets(2)
            .descriptors(vk::DescriptorType::UNIFORM_BUFFER, 2)
            .descriptors(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 2);
        let shadow = DescriptorBudget::new()
            .sets(2)
            .descriptors(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 2);
        let opaque = DescriptorBudget::new()
            .sets(1)
            .descriptors(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 8);

        let total = DescriptorBudget::new().merge(&globals).merge(&shadow).merge(&opaque);
        assert_eq!(total.set_count(), 5);

        let sizes: Vec<(vk::DescriptorType, u32)> =
            total.pool_sizes().iter().map(|size| (size.ty, size.descriptor_count)).collect();
        assert_eq!(sizes.len(), 3);
        assert!(sizes.contains(&(vk::DescriptorType::UNIFORM_BUFFER, 2)));
        assert!(sizes.contains(&(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 4)));
        assert!(sizes.contains(&(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 8)));
    }

    #[test]
    fn test_empty_budget_has_no_pool_sizes() {
        let budget = DescriptorBudget::new().descriptors(vk::DescriptorType::STORAGE_BUFFER, 0);
        assert_eq!(budget.set_count(), 0);
        assert!(budget.pool_sizes().is_empty());
    }
}
