//! The hanging protocol data model.
//!
//! A hanging protocol describes how to lay out images on screens:
//! which image sets to build from the available series (via selectors),
//! which display sets to place them in,
//! and how scrolling and navigation tie display sets together.
//!
//! The model maintains two cross-reference invariants:
//!
//! - a display set's `image_set_number` always equals
//!   the position of its image set plus one;
//! - scrolling and navigation groups only reference display sets
//!   that exist, so removing a display set cascades into the groups.

use dicom_core::Tag;

/// How a selector constrains an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorUsage {
    /// the attribute must match one of the values
    Match,
    /// the attribute must not match any of the values
    NoMatch,
}

/// A predicate over one DICOM attribute,
/// used to assign images to an image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    /// the attribute the predicate applies to
    pub tag: Tag,
    /// the sequence pointer when the attribute is nested, if any
    pub sequence_pointer: Option<Tag>,
    /// how the values constrain the attribute
    pub usage: SelectorUsage,
    /// the values to match against
    pub values: Vec<String>,
}

/// A time-based sub-selection of an image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBasedImageSet {
    /// number of this sub-selection within its image set, starting at 1
    pub image_set_number: u32,
    /// relative time in the unit below, counted backwards from now
    pub relative_time: Option<(u32, u32)>,
    /// abstract prior value: position in a ranked list of prior studies
    pub abstract_prior_value: Option<i32>,
}

/// An ordered set of selectors plus its time-based sub-selections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageSet {
    pub selectors: Vec<Selector>,
    pub time_based: Vec<TimeBasedImageSet>,
}

/// One rectangle of one screen, in relative coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenDefinition {
    /// number of vertical pixels of the screen
    pub rows: u32,
    /// number of horizontal pixels of the screen
    pub columns: u32,
    /// display environment spatial position, as fractions of the screen
    pub position: [f64; 4],
}

/// A named variant of the protocol for a class of workstations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub modality: Option<String>,
    pub anatomic_region: Option<String>,
    pub laterality: Option<String>,
    pub procedure_code: Option<String>,
    pub reason_for_requested_procedure: Option<String>,
}

/// Where and how one image set is shown.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySet {
    /// one-based index into the protocol's image sets
    pub image_set_number: u32,
    /// the presentation group this display set belongs to, >= 1
    pub presentation_group: u32,
    /// display environment spatial position, as fractions of the screen
    pub image_box_position: [f64; 4],
    /// scroll amount when part of a scrolling group
    pub scroll_amount: Option<u32>,
}

/// Display sets which scroll together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScrollingGroup {
    /// one-based references into the display set list
    pub display_sets: Vec<u32>,
}

/// Display sets navigated as alternatives of one another.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NavigationGroup {
    /// the display set used as the navigation reference, if any
    pub reference_display_set: Option<u32>,
    /// one-based references into the display set list
    pub display_sets: Vec<u32>,
}

/// A complete hanging protocol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HangingProtocol {
    pub name: String,
    pub description: Option<String>,
    pub number_of_priors_referenced: u32,
    pub definitions: Vec<Definition>,
    pub screen_definitions: Vec<ScreenDefinition>,
    image_sets: Vec<ImageSet>,
    display_sets: Vec<DisplaySet>,
    scrolling_groups: Vec<ScrollingGroup>,
    navigation_groups: Vec<NavigationGroup>,
}

/// A violation of the model's cross-reference invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `display_sets[index]` references a missing image set
    DanglingImageSet { index: usize, image_set_number: u32 },
    /// `display_sets[index]` has a presentation group below 1
    BadPresentationGroup { index: usize },
    /// a scrolling group references a missing display set
    DanglingScrollingReference { group: usize, display_set: u32 },
    /// a navigation group references a missing display set
    DanglingNavigationReference { group: usize, display_set: u32 },
}

impl HangingProtocol {
    pub fn new(name: impl Into<String>) -> HangingProtocol {
        HangingProtocol {
            name: name.into(),
            ..HangingProtocol::default()
        }
    }

    pub fn image_sets(&self) -> &[ImageSet] {
        &self.image_sets
    }

    pub fn display_sets(&self) -> &[DisplaySet] {
        &self.display_sets
    }

    pub fn scrolling_groups(&self) -> &[ScrollingGroup] {
        &self.scrolling_groups
    }

    pub fn navigation_groups(&self) -> &[NavigationGroup] {
        &self.navigation_groups
    }

    /// Append an image set, returning its one-based number.
    pub fn add_image_set(&mut self, image_set: ImageSet) -> u32 {
        self.image_sets.push(image_set);
        self.image_sets.len() as u32
    }

    /// Append a display set showing the image set with the given number.
    ///
    /// The number must reference an existing image set
    /// and the presentation group must be at least 1.
    pub fn add_display_set(&mut self, display_set: DisplaySet) -> Result<u32, ValidationError> {
        if display_set.image_set_number == 0
            || display_set.image_set_number as usize > self.image_sets.len()
        {
            return Err(ValidationError::DanglingImageSet {
                index: self.display_sets.len(),
                image_set_number: display_set.image_set_number,
            });
        }
        if display_set.presentation_group == 0 {
            return Err(ValidationError::BadPresentationGroup {
                index: self.display_sets.len(),
            });
        }
        self.display_sets.push(display_set);
        Ok(self.display_sets.len() as u32)
    }

    pub fn add_scrolling_group(&mut self, group: ScrollingGroup) {
        self.scrolling_groups.push(group);
    }

    pub fn add_navigation_group(&mut self, group: NavigationGroup) {
        self.navigation_groups.push(group);
    }

    /// Remove the image set with the given one-based number.
    ///
    /// Display sets referencing it are removed as well (cascading into
    /// the groups), and references to later image sets are renumbered
    /// so that every display set keeps pointing at the same image set.
    pub fn remove_image_set(&mut self, image_set_number: u32) -> Option<ImageSet> {
        if image_set_number == 0 || image_set_number as usize > self.image_sets.len() {
            return None;
        }
        let removed = self.image_sets.remove(image_set_number as usize - 1);

        // cascade: drop the display sets of this image set, back to front
        // so that the numbers collected first stay valid
        let doomed: Vec<u32> = self
            .display_sets
            .iter()
            .enumerate()
            .filter(|(_, ds)| ds.image_set_number == image_set_number)
            .map(|(index, _)| index as u32 + 1)
            .collect();
        for number in doomed.into_iter().rev() {
            self.remove_display_set(number);
        }

        // renumber references to the image sets that moved down
        for display_set in &mut self.display_sets {
            if display_set.image_set_number > image_set_number {
                display_set.image_set_number -= 1;
            }
        }
        Some(removed)
    }

    /// Remove the display set with the given one-based number.
    ///
    /// References in scrolling and navigation groups are dropped
    /// and renumbered; groups left with fewer than two members
    /// are removed entirely.
    pub fn remove_display_set(&mut self, display_set_number: u32) -> Option<DisplaySet> {
        if display_set_number == 0 || display_set_number as usize > self.display_sets.len() {
            return None;
        }
        let removed = self.display_sets.remove(display_set_number as usize - 1);

        for group in &mut self.scrolling_groups {
            group.display_sets.retain(|ds| *ds != display_set_number);
            for ds in &mut group.display_sets {
                if *ds > display_set_number {
                    *ds -= 1;
                }
            }
        }
        // a scrolling group needs at least two members to scroll
        self.scrolling_groups
            .retain(|group| group.display_sets.len() >= 2);

        for group in &mut self.navigation_groups {
            group.display_sets.retain(|ds| *ds != display_set_number);
            for ds in &mut group.display_sets {
                if *ds > display_set_number {
                    *ds -= 1;
                }
            }
            group.reference_display_set = match group.reference_display_set {
                Some(reference) if reference == display_set_number => None,
                Some(reference) if reference > display_set_number => Some(reference - 1),
                other => other,
            };
        }
        self.navigation_groups
            .retain(|group| !group.display_sets.is_empty() || group.reference_display_set.is_some());

        Some(removed)
    }

    /// Check every cross-reference invariant.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (index, display_set) in self.display_sets.iter().enumerate() {
            if display_set.image_set_number == 0
                || display_set.image_set_number as usize > self.image_sets.len()
            {
                errors.push(ValidationError::DanglingImageSet {
                    index,
                    image_set_number: display_set.image_set_number,
                });
            }
            if display_set.presentation_group == 0 {
                errors.push(ValidationError::BadPresentationGroup { index });
            }
        }

        for (group, scrolling) in self.scrolling_groups.iter().enumerate() {
            for display_set in &scrolling.display_sets {
                if *display_set == 0 || *display_set as usize > self.display_sets.len() {
                    errors.push(ValidationError::DanglingScrollingReference {
                        group,
                        display_set: *display_set,
                    });
                }
            }
        }
        for (group, navigation) in self.navigation_groups.iter().enumerate() {
            let references = navigation
                .display_sets
                .iter()
                .copied()
                .chain(navigation.reference_display_set);
            for display_set in references {
                if display_set == 0 || display_set as usize > self.display_sets.len() {
                    errors.push(ValidationError::DanglingNavigationReference {
                        group,
                        display_set,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display_set(image_set_number: u32) -> DisplaySet {
        DisplaySet {
            image_set_number,
            presentation_group: 1,
            image_box_position: [0.0, 0.0, 1.0, 1.0],
            scroll_amount: None,
        }
    }

    fn protocol_with_three_display_sets() -> HangingProtocol {
        let mut hp = HangingProtocol::new("CT two-up");
        let a = hp.add_image_set(ImageSet::default());
        let b = hp.add_image_set(ImageSet::default());
        hp.add_display_set(display_set(a)).unwrap();
        hp.add_display_set(display_set(b)).unwrap();
        hp.add_display_set(display_set(b)).unwrap();
        hp.add_scrolling_group(ScrollingGroup {
            display_sets: vec![1, 2],
        });
        hp.add_navigation_group(NavigationGroup {
            reference_display_set: Some(3),
            display_sets: vec![1, 2],
        });
        hp
    }

    #[test]
    fn display_sets_must_reference_existing_image_sets() {
        let mut hp = HangingProtocol::new("broken");
        assert!(matches!(
            hp.add_display_set(display_set(1)),
            Err(ValidationError::DanglingImageSet { .. })
        ));

        hp.add_image_set(ImageSet::default());
        assert!(hp.add_display_set(display_set(1)).is_ok());
        let mut bad = display_set(1);
        bad.presentation_group = 0;
        assert!(matches!(
            hp.add_display_set(bad),
            Err(ValidationError::BadPresentationGroup { .. })
        ));
    }

    #[test]
    fn removing_a_display_set_cascades_into_groups() {
        let mut hp = protocol_with_three_display_sets();
        assert!(hp.validate().is_ok());

        // removing display set 2 renumbers 3 -> 2 in the groups
        hp.remove_display_set(2).unwrap();
        assert!(hp.validate().is_ok());

        // the scrolling group fell below two members and is gone
        assert!(hp.scrolling_groups().is_empty());
        // the navigation group kept its renumbered references
        let nav = &hp.navigation_groups()[0];
        assert_eq!(nav.reference_display_set, Some(2));
        assert_eq!(nav.display_sets, vec![1]);
    }

    #[test]
    fn removing_an_image_set_cascades_into_display_sets() {
        let mut hp = protocol_with_three_display_sets();

        // image set 2 backs display sets 2 and 3
        hp.remove_image_set(2).unwrap();
        assert!(hp.validate().is_ok());
        assert_eq!(hp.display_sets().len(), 1);
        assert_eq!(hp.display_sets()[0].image_set_number, 1);
        assert_eq!(hp.image_sets().len(), 1);
    }

    #[test]
    fn validation_reports_dangling_references() {
        let mut hp = HangingProtocol::new("dangling");
        hp.add_image_set(ImageSet::default());
        hp.add_display_set(display_set(1)).unwrap();
        hp.add_scrolling_group(ScrollingGroup {
            display_sets: vec![1, 9],
        });

        let errors = hp.validate().unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DanglingScrollingReference {
                group: 0,
                display_set: 9
            }]
        );
    }
}
