//! Turns the plain [`crate::send::DataSender`] / [`crate::recv::DeliveryHandler`]
//! structs into "strands": one `tokio` task owning an `mpsc` inbox, so all
//! access to a given component's state is serialized onto a single task
//! exactly as the design notes require, without a recursive mutex anywhere.

use safir_core::{NodeId, NodeTable};
use safir_wire::SendMethod;
use tokio::sync::{mpsc, oneshot};

use crate::{
    recv::{DeliveredMessage, DeliveryHandler},
    send::{Admission, DataSender, OutboundDatagram},
};

/// Work posted onto a [`DataSender`]'s strand.
pub enum SendCommand {
    Enqueue {
        to: NodeId,
        payload: Vec<u8>,
        data_type: i64,
        reply: oneshot::Sender<Admission>,
    },
    Flush {
        nodes_snapshot: NodeTable,
        reply: oneshot::Sender<(Vec<OutboundDatagram>, NodeTable)>,
    },
    Ack {
        acker: NodeId,
        send_method: SendMethod,
        biggest_seq: u64,
        missing: Vec<bool>,
    },
    RetransmitTick {
        reply: oneshot::Sender<(Vec<OutboundDatagram>, Vec<NodeId>)>,
    },
    RemoveNode(NodeId),
}

/// Drives one [`DataSender`]'s strand to completion, processing commands in
/// the order they arrive until every sender is dropped.
pub async fn run_data_sender_strand(mut sender: DataSender, mut inbox: mpsc::Receiver<SendCommand>) {
    while let Some(command) = inbox.recv().await {
        match command {
            SendCommand::Enqueue {
                to,
                payload,
                data_type,
                reply,
            } => {
                let admission = sender.add_to_send_queue(to, &payload, data_type);
                let _ = reply.send(admission);
            }
            SendCommand::Flush {
                mut nodes_snapshot,
                reply,
            } => {
                let out = sender.handle_send_queue(tokio::time::Instant::now().into_std(), &mut nodes_snapshot);
                let _ = reply.send((out, nodes_snapshot));
            }
            SendCommand::Ack {
                acker,
                send_method,
                biggest_seq,
                missing,
            } => {
                sender.handle_ack(acker, send_method, biggest_seq, &missing);
            }
            SendCommand::RetransmitTick { reply } => {
                let result = sender.retransmit_unacked(tokio::time::Instant::now().into_std());
                let _ = reply.send(result);
            }
            SendCommand::RemoveNode(id) => sender.remove_node(id),
        }
    }
}

/// Work posted onto a [`DeliveryHandler`]'s strand.
pub enum RecvCommand {
    Receive {
        peer: NodeId,
        header: safir_wire::MessageHeader,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(bool, Vec<DeliveredMessage>), safir_core::ProtocolViolation>>,
    },
    BuildAck {
        peer: NodeId,
        send_method: SendMethod,
        reply: oneshot::Sender<safir_wire::Ack>,
    },
    MarkConsumed(usize),
}

/// Drives one [`DeliveryHandler`]'s strand to completion.
pub async fn run_delivery_handler_strand(
    mut handler: DeliveryHandler,
    mut inbox: mpsc::Receiver<RecvCommand>,
) {
    while let Some(command) = inbox.recv().await {
        match command {
            RecvCommand::Receive {
                peer,
                header,
                payload,
                reply,
            } => {
                let result = handler
                    .receive(peer, &header, &payload)
                    .map(|outcome| (outcome.ack_now, outcome.delivered));
                let _ = reply.send(result);
            }
            RecvCommand::BuildAck {
                peer,
                send_method,
                reply,
            } => {
                let ack = handler.build_ack(peer, send_method);
                let _ = reply.send(ack);
            }
            RecvCommand::MarkConsumed(count) => handler.mark_consumed(count),
        }
    }
}
