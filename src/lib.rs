/*
 * Copyright (C) 2020-2021 Fanout, Inc.
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod cgi;
pub mod cliargs;
pub mod core;
pub mod gateway;
pub mod multipart;
pub mod response;
pub mod upload;

/// Result of feeding a chunk of input to a parser.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseOutcome {
    // input was consumed, and more is expected
    NeedMoreData,

    // the end of the input was recognized
    Complete,
}
