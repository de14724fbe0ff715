// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unit tests for the controller emulation.

mod test_helpers;
