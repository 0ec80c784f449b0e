/*
 * Copyright (C) 2024 Fastly, Inc.
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

mod message;
mod protocol;

pub use message::{header, Headers, Message, Method, Request, Response, Status, Version};
pub use protocol::{
    content_length, find_header_end, find_header_end_from, has_directive, max_age,
    parse_request, parse_request_head, parse_response, parse_response_head, serialize, Error,
    HEADERS_MAX,
};
