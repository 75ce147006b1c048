// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// If a lock is poisoned then the pending-operation bookkeeping may have been left in a torn
// state and execution cannot continue because the exactly-once completion guarantee can no
// longer be upheld.
pub const ERR_POISONED_LOCK: &str = "poisoned lock - cannot continue execution because completion delivery guarantees can no longer be upheld";
