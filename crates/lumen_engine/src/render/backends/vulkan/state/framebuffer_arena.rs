//! Stable ids for offscreen framebuffers
//!
//! The owning system keeps the [`FramebufferId`]; systems reading one of its
//! attachments hold an [`AttachmentRef`] and resolve it again after every
//! resize instead of caching the view.

use ash::vk;
use slotmap::{new_key_type, SlotMap};

use super::Framebuffer;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

new_key_type! {
    /// Stable handle to a framebuffer owned by the arena
    pub struct FramebufferId;
}

/// Anything that exposes attachment views by index
pub trait AttachmentViews {
    /// View of attachment `index`, if present
    fn attachment_view(&self, index: usize) -> Option<vk::ImageView>;
}

impl AttachmentViews for Framebuffer {
    fn attachment_view(&self, index: usize) -> Option<vk::ImageView> {
        self.attachment(index).map(|a| a.view())
    }
}

/// Non-owning reference to another framebuffer's attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Owning framebuffer
    pub framebuffer: FramebufferId,
    /// Attachment index inside it
    pub attachment: usize,
}

/// Owner of every offscreen framebuffer
pub struct FramebufferArena<F: AttachmentViews = Framebuffer> {
    framebuffers: SlotMap<FramebufferId, F>,
}

impl<F: AttachmentViews> Default for FramebufferArena<F> {
    fn default() -> Self {
        Self {
            framebuffers: SlotMap::with_key(),
        }
    }
}

impl<F: AttachmentViews> FramebufferArena<F> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a framebuffer
    pub fn insert(&mut self, framebuffer: F) -> FramebufferId {
        self.framebuffers.insert(framebuffer)
    }

    /// Borrow a framebuffer
    pub fn get(&self, id: FramebufferId) -> VulkanResult<&F> {
        self.framebuffers.get(id).ok_or(VulkanError::StaleAttachment)
    }

    /// Mutably borrow a framebuffer (resize rebuilds it in place, keeping the id)
    pub fn get_mut(&mut self, id: FramebufferId) -> VulkanResult<&mut F> {
        self.framebuffers.get_mut(id).ok_or(VulkanError::StaleAttachment)
    }

    /// Drop a framebuffer; outstanding refs to it become stale
    pub fn remove(&mut self, id: FramebufferId) -> Option<F> {
        self.framebuffers.remove(id)
    }

    /// Current view behind `reference`
    pub fn resolve(&self, reference: AttachmentRef) -> VulkanResult<vk::ImageView> {
        self.get(reference.framebuffer)?
            .attachment_view(reference.attachment)
            .ok_or(VulkanError::StaleAttachment)
    }

    /// Number of framebuffers
    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    struct FakeTarget {
        views: Vec<vk::ImageView>,
    }

    impl AttachmentViews for FakeTarget {
        fn attachment_view(&self, index: usize) -> Option<vk::ImageView> {
            self.views.get(index).copied()
        }
    }

    #[test]
    fn test_resolve_follows_rebuild_under_same_id() {
        let mut arena = FramebufferArena::new();
        let id = arena.insert(FakeTarget {
            views: vec![vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)],
        });
        let depth = AttachmentRef { framebuffer: id, attachment: 1 };
        assert_eq!(arena.resolve(depth).unwrap(), vk::ImageView::from_raw(2));

        arena.get_mut(id).unwrap().views = vec![vk::ImageView::from_raw(3), vk::ImageView::from_raw(4)];
        assert_eq!(arena.resolve(depth).unwrap(), vk::ImageView::from_raw(4));
    }

    #[test]
    fn test_removed_owner_makes_refs_stale() {
        let mut arena = FramebufferArena::new();
        let id = arena.insert(FakeTarget {
            views: vec![vk::ImageView::from_raw(1)],
        });
        let reference = AttachmentRef { framebuffer: id, attachment: 0 };
        assert!(arena.remove(id).is_some());

        // a new framebuffer must not be reachable through the old id
        arena.insert(FakeTarget {
            views: vec![vk::ImageView::from_raw(9)],
        });
        assert!(matches!(arena.resolve(reference), Err(VulkanError::StaleAttachment)));
    }

    #[test]
    fn test_missing_attachment_index_is_stale() {
        let mut arena = FramebufferArena::new();
        let id = arena.insert(FakeTarget { views: Vec::new() });
        let reference = AttachmentRef { framebuffer: id, attachment: 0 };
        assert!(matches!(arena.resolve(reference), Err(VulkanError::StaleAttachment)));
    }
}
