//! Frame slot rotation and the image-to-slot fence table
//!
//! The pacer only tracks indices. [`Presenter`](super::Presenter) turns its
//! answers into fence waits.

/// Frame slot and swapchain image bookkeeping
#[derive(Debug, Clone)]
pub struct FramePacer {
    frames_in_flight: usize,
    current_slot: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FramePacer {
    /// Pacer for `frames_in_flight` slots over `image_count` swapchain images
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        debug_assert!(frames_in_flight > 0, "at least one frame slot is required");
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_slot: 0,
            images_in_flight: vec![None; image_count],
        }
    }

    /// Slot whose resources the frame being recorded uses
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Number of rotating slots
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Record that the current slot is about to render into `image_index`
    ///
    /// Returns the other slot whose fence must be waited on first, if the image
    /// is still owned by an earlier submission from a different slot.
    pub fn claim_image(&mut self, image_index: usize) -> Option<usize> {
        if image_index >= self.images_in_flight.len() {
            self.images_in_flight.resize(image_index + 1, None);
        }
        let previous = self.images_in_flight[image_index].replace(self.current_slot);
        previous.filter(|&slot| slot != self.current_slot)
    }

    /// Move to the next slot after a successful submission
    pub fn advance(&mut self) {
        self.current_slot = (self.current_slot + 1) % self.frames_in_flight;
    }

    /// Forget image ownership after the swapchain was rebuilt
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    /// Number of swapchain images tracked
    pub fn image_count(&self) -> usize {
        self.images_in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fences that only signal when the CPU explicitly waits on them
    struct SimulatedGpu {
        pending: Vec<bool>,
    }

    impl SimulatedGpu {
        fn wait(&mut self, slot: usize) {
            self.pending[slot] = false;
        }
    }

    fn run_frames(frames_in_flight: usize, image_order: &[usize], image_count: usize) {
        let mut pacer = FramePacer::new(frames_in_flight, image_count);
        let mut gpu = SimulatedGpu {
            pending: vec![false; frames_in_flight],
        };
        let mut image_owner: Vec<Option<usize>> = vec![None; image_count];

        for &image in image_order {
            let slot = pacer.current_slot();
            gpu.wait(slot);
            if let Some(other) = pacer.claim_image(image) {
                gpu.wait(other);
            }
            if let Some(owner) = image_owner[image] {
                assert!(!gpu.pending[owner], "image {} still written by slot {}", image, owner);
            }
            assert!(!gpu.pending[slot], "slot {} reused before its fence signaled", slot);

            gpu.pending[slot] = true;
            image_owner[image] = Some(slot);
            assert!(gpu.pending.iter().filter(|&&p| p).count() <= frames_in_flight);
            pacer.advance();
        }
    }

    #[test]
    fn test_slots_rotate_modulo_frames_in_flight() {
        let mut pacer = FramePacer::new(2, 3);
        let slots: Vec<usize> = (0..5)
            .map(|_| {
                let slot = pacer.current_slot();
                pacer.advance();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_claim_reports_collision_with_other_slot() {
        let mut pacer = FramePacer::new(2, 3);
        assert_eq!(pacer.claim_image(0), None);
        pacer.advance();
        assert_eq!(pacer.claim_image(0), Some(0));
        pacer.advance();
        // same slot reclaiming its own image needs no extra wait
        assert_eq!(pacer.claim_image(0), Some(1));
        assert_eq!(pacer.claim_image(0), None);
    }

    #[test]
    fn test_frame_slot_bound_more_images_than_slots() {
        run_frames(2, &[0, 1, 2, 0, 1, 2, 0, 1, 2], 3);
    }

    #[test]
    fn test_frame_slot_bound_out_of_order_images() {
        run_frames(2, &[2, 0, 0, 1, 2, 2, 1, 0, 1, 1], 3);
        run_frames(3, &[0, 1, 0, 1, 0, 1], 2);
    }

    #[test]
    fn test_reset_images_clears_ownership() {
        let mut pacer = FramePacer::new(2, 2);
        pacer.claim_image(1);
        pacer.advance();
        pacer.reset_images(4);
        assert_eq!(pacer.image_count(), 4);
        assert_eq!(pacer.claim_image(1), None);
    }
}
