use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing the collection of wakers that are all
/// waiting on a single result slot. Unlike a lazily driven batch, a slot is
/// resolved by the background dispatcher, so no waker is special: every one
/// of them is woken exactly once, when the result arrives.
///
/// Wakers are added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be kept by the polling future and
/// can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset when the future is dropped
///
/// These tokens cannot be cloned or otherwise duplicated; this helps to
/// ensure that their lifespan is correctly associated with a particular
/// future.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. A slot is resolved once and
    // polled a bounded number of times, so there's no chance of running out.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. When the future is re-polled, replace_waker
    /// should be used with this token.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);

        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Update the waker stored for a token. If the token is unknown (for
    /// instance, because the set was drained by a wake_all that raced with
    /// this poll), the waker is added under that token. The waker is passed
    /// by reference and is set with clone_from because it comes from a
    /// Context and will need to be cloned anyway.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(stored) if stored.will_wake(waker) => {}
            Some(stored) => stored.clone_from(waker),
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }
    }

    /// Discard a waker from this set. No-op if the token isn't present.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
