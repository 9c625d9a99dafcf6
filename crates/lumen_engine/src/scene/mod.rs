//! Entity-component scene
//!
//! Entities are generational `slotmap` keys; each component type lives in its
//! own `SecondaryMap`. Views iterate the storage of the first component type
//! and filter on the others, so iteration order is stable between frames.

pub mod camera;
pub mod components;

pub use camera::Camera;
pub use components::{
    CameraComponent, MeshComponent, NameComponent, PointLightComponent, TransformComponent,
};

use slotmap::{new_key_type, SecondaryMap, SlotMap};

new_key_type! {
    /// Opaque entity handle
    pub struct Entity;
}

/// Component storage access, implemented for every component type the scene knows
pub trait Component: Sized + 'static {
    /// Shared storage for this component type
    fn storage(scene: &Scene) -> &SecondaryMap<Entity, Self>;

    /// Mutable storage for this component type
    fn storage_mut(scene: &mut Scene) -> &mut SecondaryMap<Entity, Self>;
}

macro_rules! impl_component {
    ($component:ty, $field:ident) => {
        impl Component for $component {
            fn storage(scene: &Scene) -> &SecondaryMap<Entity, Self> {
                &scene.$field
            }

            fn storage_mut(scene: &mut Scene) -> &mut SecondaryMap<Entity, Self> {
                &mut scene.$field
            }
        }
    };
}

impl_component!(TransformComponent, transforms);
impl_component!(MeshComponent, meshes);
impl_component!(PointLightComponent, point_lights);
impl_component!(CameraComponent, cameras);
impl_component!(NameComponent, names);

/// Scene container
#[derive(Default)]
pub struct Scene {
    entities: SlotMap<Entity, ()>,
    transforms: SecondaryMap<Entity, TransformComponent>,
    meshes: SecondaryMap<Entity, MeshComponent>,
    point_lights: SecondaryMap<Entity, PointLightComponent>,
    cameras: SecondaryMap<Entity, CameraComponent>,
    names: SecondaryMap<Entity, NameComponent>,
}

impl Scene {
    /// Create an empty scene
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity with no components
    pub fn create_entity(&mut self) -> Entity {
        self.entities.insert(())
    }

    /// Destroy an entity and all its components; returns false if it was already gone
    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        if self.entities.remove(entity).is_none() {
            return false;
        }
        self.transforms.remove(entity);
        self.meshes.remove(entity);
        self.point_lights.remove(entity);
        self.cameras.remove(entity);
        self.names.remove(entity);
        true
    }

    /// Whether the entity is alive
    pub fn contains(&self, entity: Entity) -> bool {
        self.entities.contains_key(entity)
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the scene has no entities
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Attach a component, returning the one it replaced
    ///
    /// Inserting on a destroyed entity is ignored.
    pub fn insert<C: Component>(&mut self, entity: Entity, component: C) -> Option<C> {
        if !self.contains(entity) {
            log::warn!("Ignoring component insert on destroyed entity {:?}", entity);
            return None;
        }
        C::storage_mut(self).insert(entity, component)
    }

    /// Shared access to one component
    pub fn get<C: Component>(&self, entity: Entity) -> Option<&C> {
        C::storage(self).get(entity)
    }

    /// Mutable access to one component
    pub fn get_mut<C: Component>(&mut self, entity: Entity) -> Option<&mut C> {
        C::storage_mut(self).get_mut(entity)
    }

    /// Detach a component
    pub fn remove<C: Component>(&mut self, entity: Entity) -> Option<C> {
        C::storage_mut(self).remove(entity)
    }

    /// All entities having component `A`
    pub fn view<A: Component>(&self) -> impl Iterator<Item = (Entity, &A)> + '_ {
        A::storage(self).iter()
    }

    /// All entities having both `A` and `B`
    pub fn view2<A: Component, B: Component>(&self) -> impl Iterator<Item = (Entity, &A, &B)> + '_ {
        let others = B::storage(self);
        A::storage(self)
            .iter()
            .filter_map(move |(entity, a)| others.get(entity).map(|b| (entity, a, b)))
    }

    /// First camera component in the scene
    pub fn active_camera(&self) -> Option<&Camera> {
        self.view::<CameraComponent>().next().map(|(_, component)| &component.camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;

    #[test]
    fn test_view2_requires_both_components() {
        let mut scene = Scene::new();
        let lit = scene.create_entity();
        scene.insert(lit, TransformComponent::from_position(Vec3::new(1.0, 0.0, 0.0)));
        scene.insert(lit, PointLightComponent::default());
        let bare = scene.create_entity();
        scene.insert(bare, TransformComponent::default());

        let hits: Vec<Entity> = scene
            .view2::<TransformComponent, PointLightComponent>()
            .map(|(entity, _, _)| entity)
            .collect();
        assert_eq!(hits, vec![lit]);
        assert_eq!(scene.view::<TransformComponent>().count(), 2);
    }

    #[test]
    fn test_destroy_removes_components_and_invalidates_handle() {
        let mut scene = Scene::new();
        let entity = scene.create_entity();
        scene.insert(entity, NameComponent("crate".into()));
        assert!(scene.destroy_entity(entity));
        assert!(!scene.destroy_entity(entity));
        assert!(scene.get::<NameComponent>(entity).is_none());

        let reused = scene.create_entity();
        assert_ne!(reused, entity);
        assert!(scene.insert(entity, NameComponent("ghost".into())).is_none());
        assert!(scene.get::<NameComponent>(reused).is_none());
    }

    #[test]
    fn test_get_mut_writes_back() {
        let mut scene = Scene::new();
        let entity = scene.create_entity();
        scene.insert(entity, TransformComponent::default());
        if let Some(transform) = scene.get_mut::<TransformComponent>(entity) {
            transform.transform.position.y = 3.0;
        }
        let position = scene.get::<TransformComponent>(entity).map(|t| t.transform.position);
        assert_eq!(position, Some(Vec3::new(0.0, 3.0, 0.0)));
    }

    #[test]
    fn test_insert_replaces_previous_component() {
        let mut scene = Scene::new();
        let entity = scene.create_entity();
        assert!(scene.insert(entity, NameComponent("a".into())).is_none());
        let previous = scene.insert(entity, NameComponent("b".into()));
        assert_eq!(previous, Some(NameComponent("a".into())));
        assert!(scene.remove::<NameComponent>(entity).is_some());
        assert!(scene.get::<NameComponent>(entity).is_none());
    }
}
