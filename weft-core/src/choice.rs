use bitflags::bitflags;
use thiserror::Error;

use crate::hash::StrHash;
use crate::variant::Variant;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct OptionFlags: u8 {
        const IS_AVAILABLE = 1;
        const IS_SELECTOR = 2;
        const HAS_DATA = 4;
    }
}

/// One selectable option offered to the player.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceOption {
    pub target: Variant,
    pub line: StrHash,
    pub flags: OptionFlags,
    pub index: u16,
    answers: (u16, u16),
    data: (u16, u16),
}

/// A sub-selection that resolves a selector option to a different final
/// target. An answer with a null id is the default fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceAnswer {
    pub id: Variant,
    pub target: Variant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceDatum {
    pub id: StrHash,
    pub value: Variant,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ChoiceState {
    #[default]
    Accumulating,
    Offering,
    Chosen,
}

/// Misuse of the buffer is a host/internal bug, not a script-authoring
/// mistake, so these are hard errors.
#[derive(Debug, Error)]
pub enum ChoiceError {
    #[error("choice buffer is not accumulating (state: {0:?})")]
    NotAccumulating(ChoiceState),
    #[error("choice buffer is not offering (state: {0:?})")]
    NotOffering(ChoiceState),
    #[error("'{0}' has no option to attach to")]
    NoOption(&'static str),
    #[error("chosen target {0} is not among the offered options")]
    UnknownTarget(Variant),
}

/// Accumulates pending options, locks for presentation, then resolves to a
/// single chosen target: `Accumulating → Offering → Chosen → (reset)`.
#[derive(Debug, Default)]
pub struct ChoiceBuffer {
    state: ChoiceState,
    options: Vec<ChoiceOption>,
    answers: Vec<ChoiceAnswer>,
    data: Vec<ChoiceDatum>,
    chosen: Option<Variant>,
}

impl ChoiceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ChoiceState {
        self.state
    }

    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    pub fn options(&self) -> &[ChoiceOption] {
        &self.options
    }

    pub fn available(&self) -> impl Iterator<Item = &ChoiceOption> {
        self.options
            .iter()
            .filter(|o| o.flags.contains(OptionFlags::IS_AVAILABLE))
    }

    pub fn available_count(&self) -> usize {
        self.available().count()
    }

    pub fn answers_for(&self, option: &ChoiceOption) -> &[ChoiceAnswer] {
        let (off, len) = option.answers;
        &self.answers[off as usize..(off + len) as usize]
    }

    /// Custom datum attached to an option, by id.
    pub fn datum(&self, option_index: u16, id: StrHash) -> Option<Variant> {
        let option = self.options.get(option_index as usize)?;
        let (off, len) = option.data;
        self.data[off as usize..(off + len) as usize]
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.value)
    }

    fn ensure_accumulating(&self) -> Result<(), ChoiceError> {
        match self.state() {
            ChoiceState::Accumulating => Ok(()),
            s => Err(ChoiceError::NotAccumulating(s)),
        }
    }

    pub fn add_option(
        &mut self,
        target: Variant,
        line: StrHash,
        available: bool,
        selector: bool,
    ) -> Result<(), ChoiceError> {
        self.ensure_accumulating()?;
        let mut flags = OptionFlags::empty();
        if available {
            flags |= OptionFlags::IS_AVAILABLE;
        }
        if selector {
            flags |= OptionFlags::IS_SELECTOR;
        }
        let index = self.options.len() as u16;
        self.options.push(ChoiceOption {
            target,
            line,
            flags,
            index,
            answers: (self.answers.len() as u16, 0),
            data: (self.data.len() as u16, 0),
        });
        Ok(())
    }

    /// Attach an answer to the most recently added option.
    pub fn add_answer(&mut self, id: Variant, target: Variant) -> Result<(), ChoiceError> {
        self.ensure_accumulating()?;
        let Some(option) = self.options.last_mut() else {
            return Err(ChoiceError::NoOption("answer"));
        };
        option.answers.1 += 1;
        self.answers.push(ChoiceAnswer { id, target });
        Ok(())
    }

    /// Attach a custom datum to the most recently added option.
    pub fn add_data(&mut self, id: StrHash, value: Variant) -> Result<(), ChoiceError> {
        self.ensure_accumulating()?;
        let Some(option) = self.options.last_mut() else {
            return Err(ChoiceError::NoOption("data"));
        };
        option.flags |= OptionFlags::HAS_DATA;
        option.data.1 += 1;
        self.data.push(ChoiceDatum { id, value });
        Ok(())
    }

    /// Lock the buffer for presentation.
    pub fn offer(&mut self) -> Result<(), ChoiceError> {
        self.ensure_accumulating()?;
        self.state = ChoiceState::Offering;
        Ok(())
    }

    /// Resolve the offered buffer to one option's final target.
    ///
    /// `answer` resolves through the option's answer sub-table, falling
    /// back to the null-id default answer when no specific id matches.
    pub fn choose(&mut self, target: Variant, answer: Option<Variant>) -> Result<(), ChoiceError> {
        if self.state() != ChoiceState::Offering {
            return Err(ChoiceError::NotOffering(self.state()));
        }
        let option = self
            .options
            .iter()
            .find(|o| o.target.loose_eq(&target))
            .ok_or(ChoiceError::UnknownTarget(target))?;

        let answers = self.answers_for(option);
        let resolved = match answer {
            Some(id) => answers
                .iter()
                .find(|a| a.id.loose_eq(&id))
                .or_else(|| answers.iter().find(|a| a.id.is_null()))
                .map(|a| a.target)
                .unwrap_or(option.target),
            // No answer given: an option that carries answers still
            // resolves through its default; its own target is a group key.
            None => answers
                .iter()
                .find(|a| a.id.is_null())
                .map(|a| a.target)
                .unwrap_or(option.target),
        };

        self.chosen = Some(resolved);
        self.state = ChoiceState::Chosen;
        Ok(())
    }

    pub fn chosen_target(&self) -> Option<Variant> {
        self.chosen
    }

    /// Clear everything and return to `Accumulating`.
    pub fn reset(&mut self) {
        self.state = ChoiceState::Accumulating;
        self.options.clear();
        self.answers.clear();
        self.data.clear();
        self.chosen = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hash(s: &str) -> Variant {
        Variant::Hash(StrHash::new(s))
    }

    #[test]
    fn accumulate_offer_choose_reset() {
        let mut buf = ChoiceBuffer::new();
        buf.add_option(hash("a"), StrHash::new("l1"), true, false)
            .unwrap();
        buf.add_option(hash("b"), StrHash::new("l2"), false, false)
            .unwrap();
        assert_eq!(buf.option_count(), 2);
        assert_eq!(buf.available_count(), 1);

        buf.offer().unwrap();
        assert!(matches!(
            buf.add_option(hash("c"), StrHash::new("l3"), true, false),
            Err(ChoiceError::NotAccumulating(ChoiceState::Offering))
        ));

        buf.choose(hash("a"), None).unwrap();
        assert_eq!(buf.chosen_target(), Some(hash("a")));

        buf.reset();
        assert_eq!(buf.state(), ChoiceState::Accumulating);
        assert_eq!(buf.option_count(), 0);
    }

    #[test]
    fn choosing_an_absent_target_is_an_error() {
        let mut buf = ChoiceBuffer::new();
        buf.add_option(hash("a"), StrHash::new("l1"), true, false)
            .unwrap();
        buf.offer().unwrap();
        assert!(matches!(
            buf.choose(hash("zzz"), None),
            Err(ChoiceError::UnknownTarget(_))
        ));
        // still offering; a valid choice may follow
        buf.choose(hash("a"), None).unwrap();
    }

    #[test]
    fn choose_outside_offering_is_an_error() {
        let mut buf = ChoiceBuffer::new();
        buf.add_option(hash("a"), StrHash::new("l1"), true, false)
            .unwrap();
        assert!(matches!(
            buf.choose(hash("a"), None),
            Err(ChoiceError::NotOffering(ChoiceState::Accumulating))
        ));
    }

    #[test]
    fn answers_resolve_with_default_fallback() {
        let mut buf = ChoiceBuffer::new();
        buf.add_option(hash("mood"), StrHash::new("l1"), true, true)
            .unwrap();
        buf.add_answer(hash("angry"), hash("scene.storm")).unwrap();
        buf.add_answer(Variant::Null, hash("scene.calm")).unwrap();
        buf.add_option(hash("leave"), StrHash::new("l2"), true, false)
            .unwrap();

        buf.offer().unwrap();
        buf.choose(hash("mood"), Some(hash("angry"))).unwrap();
        assert_eq!(buf.chosen_target(), Some(hash("scene.storm")));

        buf.reset();
        buf.add_option(hash("mood"), StrHash::new("l1"), true, true)
            .unwrap();
        buf.add_answer(hash("angry"), hash("scene.storm")).unwrap();
        buf.add_answer(Variant::Null, hash("scene.calm")).unwrap();
        buf.offer().unwrap();
        buf.choose(hash("mood"), Some(hash("bored"))).unwrap();
        assert_eq!(buf.chosen_target(), Some(hash("scene.calm")));
    }

    #[test]
    fn no_answer_uses_the_default_when_answers_exist() {
        let mut buf = ChoiceBuffer::new();
        buf.add_option(hash("mood"), StrHash::new("l1"), true, true)
            .unwrap();
        buf.add_answer(hash("angry"), hash("scene.storm")).unwrap();
        buf.add_answer(Variant::Null, hash("scene.calm")).unwrap();
        buf.offer().unwrap();
        buf.choose(hash("mood"), None).unwrap();
        assert_eq!(buf.chosen_target(), Some(hash("scene.calm")));
    }

    #[test]
    fn data_attaches_to_last_option() {
        let mut buf = ChoiceBuffer::new();
        assert!(matches!(
            buf.add_data(StrHash::new("icon"), Variant::Int(3)),
            Err(ChoiceError::NoOption("data"))
        ));
        buf.add_option(hash("a"), StrHash::new("l1"), true, false)
            .unwrap();
        buf.add_data(StrHash::new("icon"), Variant::Int(3)).unwrap();
        buf.add_option(hash("b"), StrHash::new("l2"), true, false)
            .unwrap();

        assert_eq!(buf.datum(0, StrHash::new("icon")), Some(Variant::Int(3)));
        assert_eq!(buf.datum(1, StrHash::new("icon")), None);
        assert!(buf.options()[0].flags.contains(OptionFlags::HAS_DATA));
    }
}
