// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

/// Immutable geometry handle. Identity is the pair of buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderInfo {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u32);

/// Index of a uniform provider registered with the frame loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub material: MaterialId,
    pub uniforms: UniformId,
}

/// Render objects grouped by geometry, in insertion order.
///
/// Every mutation bumps [`Scene::revision`]; the frame loop re-records its
/// command buffers when the revision it recorded against is stale.
#[derive(Debug, Default)]
pub struct Scene {
    groups: Vec<(RenderInfo, Vec<InstanceInfo>)>,
    revision: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&mut self, geometry: RenderInfo, instance: InstanceInfo) {
        match self.groups.iter_mut().find(|(g, _)| *g == geometry) {
            Some((_, instances)) => instances.push(instance),
            None => self.groups.push((geometry, vec![instance])),
        }
        self.revision += 1;
    }

    /// Drops `geometry` and every instance drawing it.
    pub fn remove_geometry(&mut self, geometry: &RenderInfo) -> Vec<InstanceInfo> {
        match self.groups.iter().position(|(g, _)| g == geometry) {
            Some(pos) => {
                self.revision += 1;
                self.groups.remove(pos).1
            }
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        if !self.groups.is_empty() {
            self.groups.clear();
            self.revision += 1;
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = (&RenderInfo, &[InstanceInfo])> {
        self.groups.iter().map(|(g, i)| (g, i.as_slice()))
    }

    pub fn geometry_count(&self) -> usize {
        self.groups.len()
    }

    pub fn instance_count(&self) -> usize {
        self.groups.iter().map(|(_, i)| i.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn geometry(id: u64) -> RenderInfo {
        RenderInfo {
            vertex_buffer: vk::Buffer::from_raw(id),
            index_buffer: vk::Buffer::from_raw(id + 100),
            index_count: 3,
        }
    }

    const INSTANCE: InstanceInfo = InstanceInfo {
        material: MaterialId(0),
        uniforms: UniformId(0),
    };

    #[test]
    fn instances_sharing_geometry_are_grouped() {
        let mut scene = Scene::new();
        scene.add_instance(geometry(1), INSTANCE);
        scene.add_instance(geometry(2), INSTANCE);
        scene.add_instance(geometry(1), INSTANCE);

        assert_eq!(scene.geometry_count(), 2);
        assert_eq!(scene.instance_count(), 3);
        let groups: Vec<_> = scene.groups().map(|(g, i)| (*g, i.len())).collect();
        assert_eq!(groups, vec![(geometry(1), 2), (geometry(2), 1)]);
    }

    #[test]
    fn revision_moves_only_on_real_changes() {
        let mut scene = Scene::new();
        scene.clear();
        assert_eq!(scene.revision(), 0);
        assert!(scene.remove_geometry(&geometry(9)).is_empty());
        assert_eq!(scene.revision(), 0);

        scene.add_instance(geometry(1), INSTANCE);
        assert_eq!(scene.revision(), 1);
        assert_eq!(scene.remove_geometry(&geometry(1)), vec![INSTANCE]);
        assert_eq!(scene.revision(), 2);
        assert!(scene.is_empty());
    }
}
