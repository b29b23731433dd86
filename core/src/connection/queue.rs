/*
 * queue.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Smistatore, an HTTP connection manager.
 *
 * Smistatore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Smistatore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Smistatore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Pending work of a pooled connection: two priority tiers of request/reply pairs.
//!
//! Each tier is served newest first. New and requeued pairs go to the front and
//! dispatch pops from the front, so a requeued pair is the next one served.

use std::collections::VecDeque;

use crate::http::{Priority, ReplyId, Request};

/// The queued unit: a request and the id of the reply it completes.
pub(crate) struct MessagePair {
    pub(crate) request: Request,
    pub(crate) reply: ReplyId,
}

impl MessagePair {
    pub(crate) fn new(request: Request, reply: ReplyId) -> Self {
        Self { request, reply }
    }

    fn is_high(&self) -> bool {
        self.request.priority() == Priority::High
    }
}

#[derive(Default)]
pub(crate) struct PriorityQueues {
    high: VecDeque<MessagePair>,
    low: VecDeque<MessagePair>,
}

impl PriorityQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn tier(&mut self, pair: &MessagePair) -> &mut VecDeque<MessagePair> {
        if pair.is_high() {
            &mut self.high
        } else {
            &mut self.low
        }
    }

    pub(crate) fn enqueue(&mut self, pair: MessagePair) {
        self.tier(&pair).push_front(pair);
    }

    /// Put back a pair a channel gave up on.
    pub(crate) fn requeue(&mut self, pair: MessagePair) {
        self.tier(&pair).push_front(pair);
    }

    /// Requeue pairs taken from a pipeline so the earliest sent is served first.
    pub(crate) fn requeue_all(&mut self, pairs: impl DoubleEndedIterator<Item = MessagePair>) {
        for pair in pairs.rev() {
            self.requeue(pair);
        }
    }

    /// Next pair to serve: high tier before low, newest first within a tier.
    pub(crate) fn dequeue(&mut self) -> Option<MessagePair> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    /// Take the first pair in the given tier, in serving order, that satisfies `accept`.
    pub(crate) fn take_first_matching(
        &mut self,
        high: bool,
        accept: impl Fn(&Request) -> bool,
    ) -> Option<MessagePair> {
        let tier = if high { &mut self.high } else { &mut self.low };
        let index = tier.iter().position(|pair| accept(&pair.request))?;
        tier.remove(index)
    }

    pub(crate) fn remove(&mut self, reply: ReplyId) -> Option<MessagePair> {
        for tier in [&mut self.high, &mut self.low] {
            if let Some(index) = tier.iter().position(|pair| pair.reply == reply) {
                return tier.remove(index);
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    /// Reply of the pair `dequeue` would return.
    pub(crate) fn first_reply(&self) -> Option<ReplyId> {
        self.high.front().or_else(|| self.low.front()).map(|pair| pair.reply)
    }

    /// Reply ids in serving order.
    pub(crate) fn reply_ids(&self) -> Vec<ReplyId> {
        self.high.iter().chain(self.low.iter()).map(|pair| pair.reply).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestBuilder;

    fn pair(id: u64, priority: Priority) -> MessagePair {
        let mut b = RequestBuilder::get("http://example.com/").unwrap();
        b.priority(priority);
        MessagePair::new(b.build(), ReplyId(id))
    }

    #[test]
    fn newest_first_within_priority() {
        let mut q = PriorityQueues::new();
        q.enqueue(pair(1, Priority::Low));
        q.enqueue(pair(2, Priority::High));
        q.enqueue(pair(3, Priority::High));
        q.enqueue(pair(4, Priority::Normal));
        assert_eq!(q.first_reply(), Some(ReplyId(3)));
        let order: Vec<u64> = std::iter::from_fn(|| q.dequeue()).map(|p| p.reply.0).collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn requeued_pair_served_next() {
        let mut q = PriorityQueues::new();
        q.enqueue(pair(1, Priority::Normal));
        q.enqueue(pair(2, Priority::Normal));
        let taken = q.dequeue().unwrap();
        q.enqueue(pair(3, Priority::Normal));
        q.requeue(taken);
        assert_eq!(q.reply_ids(), vec![ReplyId(2), ReplyId(3), ReplyId(1)]);
    }

    #[test]
    fn requeue_all_keeps_send_order() {
        let mut q = PriorityQueues::new();
        q.requeue_all(vec![pair(1, Priority::Normal), pair(2, Priority::Normal)].into_iter());
        assert_eq!(q.dequeue().unwrap().reply, ReplyId(1));
    }

    #[test]
    fn remove_and_match() {
        let mut q = PriorityQueues::new();
        q.enqueue(pair(1, Priority::High));
        q.enqueue(pair(2, Priority::Low));
        assert!(q.remove(ReplyId(2)).is_some());
        assert!(q.remove(ReplyId(2)).is_none());
        assert!(q.take_first_matching(false, |_| true).is_none());
        assert!(q.take_first_matching(true, |r| r.is_pipelining_allowed()).is_none());
        assert_eq!(q.take_first_matching(true, |_| true).unwrap().reply, ReplyId(1));
        assert!(q.is_empty());
    }
}
