//! Growable descriptor-set allocator, one per uniform layout.
//!
//! Sets are handed back to a LIFO reuse list on free and never returned to
//! the driver pool. When every pool is full a new one is created, each
//! `factor` times larger than the last.

use ash::vk;
use ember_render::{RenderError, Result};
use tracing::{debug, error};

use crate::error::VkResultExt;

/// The driver calls the allocator needs. `ash::Device` in production.
pub(crate) trait DescriptorPoolBackend {
    unsafe fn create_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool>;

    unsafe fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;

    unsafe fn destroy_pool(&self, pool: vk::DescriptorPool);
}

impl DescriptorPoolBackend for ash::Device {
    unsafe fn create_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        self.create_descriptor_pool(&ci, None)
            .op("vkCreateDescriptorPool")
    }

    unsafe fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool,
            descriptor_set_count: 1,
            p_set_layouts: &layout,
            ..Default::default()
        };
        Ok(self
            .allocate_descriptor_sets(&ai)
            .op("vkAllocateDescriptorSets")?[0])
    }

    unsafe fn destroy_pool(&self, pool: vk::DescriptorPool) {
        self.destroy_descriptor_pool(pool, None);
    }
}

/// What every set of one layout needs, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Properties {
    pub layout: vk::DescriptorSetLayout,
    pub sampler_count: u32,
    pub uniform_buffer_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolGrowth {
    pub initial_size: u32,
    pub factor: u32,
}

struct Pool {
    handle: vk::DescriptorPool,
    allocated: u32,
    max: u32,
}

pub(crate) struct DescriptorAllocator<B: DescriptorPoolBackend> {
    backend: B,
    props: Properties,
    pools: Vec<Pool>,
    free_sets: Vec<vk::DescriptorSet>,
    next_pool_size: u32,
    factor: u32,
    used_sets: u32,
    max_sets_count: u32,
}

impl<B: DescriptorPoolBackend> DescriptorAllocator<B> {
    pub fn new(backend: B, props: Properties, growth: PoolGrowth) -> Self {
        Self {
            backend,
            props,
            pools: Vec::new(),
            free_sets: Vec::new(),
            next_pool_size: growth.initial_size.max(1),
            factor: growth.factor.max(2),
            used_sets: 0,
            max_sets_count: 0,
        }
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.props.layout
    }

    pub fn used_sets(&self) -> u32 {
        self.used_sets
    }

    pub fn max_sets_count(&self) -> u32 {
        self.max_sets_count
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn pool_sizes(&self, max: u32) -> Result<Vec<vk::DescriptorPoolSize>> {
        let count = |per_set: u32| {
            per_set.checked_mul(max).ok_or_else(|| {
                RenderError::contract(format!(
                    "{per_set} descriptors x {max} sets overflows a pool size"
                ))
            })
        };
        let mut sizes = Vec::with_capacity(2);
        if self.props.sampler_count > 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count(self.props.sampler_count)?,
            });
        }
        if self.props.uniform_buffer_count > 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count(self.props.uniform_buffer_count)?,
            });
        }
        Ok(sizes)
    }

    unsafe fn grow(&mut self) -> Result<()> {
        let max = self.next_pool_size;
        let sizes = self.pool_sizes(max)?;
        let capacity = self
            .max_sets_count
            .checked_add(max)
            .ok_or_else(|| RenderError::contract("descriptor set capacity overflows u32"))?;
        let handle = self.backend.create_pool(&sizes, max)?;
        self.pools.push(Pool {
            handle,
            allocated: 0,
            max,
        });
        self.max_sets_count = capacity;
        self.next_pool_size = max.saturating_mul(self.factor);
        debug!(
            "descriptor pool #{} with {} sets (capacity now {})",
            self.pools.len(),
            max,
            self.max_sets_count
        );
        Ok(())
    }

    pub unsafe fn allocate_set(&mut self) -> Result<vk::DescriptorSet> {
        if let Some(set) = self.free_sets.pop() {
            self.used_sets += 1;
            return Ok(set);
        }

        let full = self.pools.last().map_or(true, |p| p.allocated == p.max);
        if full {
            self.grow()?;
        }

        let layout = self.props.layout;
        let pool = self
            .pools
            .last_mut()
            .ok_or_else(|| RenderError::contract("descriptor allocator has no pool"))?;
        let set = self.backend.allocate_set(pool.handle, layout)?;
        pool.allocated += 1;
        self.used_sets += 1;
        Ok(set)
    }

    /// The set stays valid in its pool and is handed out again next.
    pub fn free_set(&mut self, set: vk::DescriptorSet) -> Result<()> {
        if self.used_sets == 0 {
            return Err(RenderError::contract(
                "free_set called with no outstanding descriptor sets",
            ));
        }
        self.used_sets -= 1;
        self.free_sets.push(set);
        Ok(())
    }

    /// Destroys every pool. Refused while sets are still in use.
    pub unsafe fn destroy(&mut self) -> Result<()> {
        if self.used_sets != 0 {
            return Err(RenderError::contract(format!(
                "descriptor allocator destroyed with {} set(s) still in use",
                self.used_sets
            )));
        }
        self.release_pools();
        Ok(())
    }

    unsafe fn release_pools(&mut self) {
        for pool in self.pools.drain(..) {
            self.backend.destroy_pool(pool.handle);
        }
        self.free_sets.clear();
        self.max_sets_count = 0;
    }
}

impl<B: DescriptorPoolBackend> Drop for DescriptorAllocator<B> {
    fn drop(&mut self) {
        if self.used_sets != 0 {
            error!(
                "descriptor allocator dropped with {} set(s) in use",
                self.used_sets
            );
            if !std::thread::panicking() {
                debug_assert!(self.used_sets == 0, "descriptor sets leaked");
            }
        }
        unsafe { self.release_pools() };
    }
}
