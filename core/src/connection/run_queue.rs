/*
 * run_queue.rs
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

//! Deferred work. Handlers schedule follow-up steps here instead of calling them
//! directly; the connection drains the queue before returning to its caller.

use std::collections::VecDeque;

use crate::transport::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    StartNextRequest,
    ReceiveReply(ChannelId),
    SendRequest(ChannelId),
}

#[derive(Default)]
pub(crate) struct RunQueue {
    tasks: VecDeque<Task>,
    start_pending: bool,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a task. A dispatch already waiting to run absorbs further dispatch requests.
    pub(crate) fn schedule(&mut self, task: Task) {
        if task == Task::StartNextRequest {
            if self.start_pending {
                return;
            }
            self.start_pending = true;
        }
        self.tasks.push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<Task> {
        let task = self.tasks.pop_front()?;
        if task == Task::StartNextRequest {
            self.start_pending = false;
        }
        Some(task)
    }
}
